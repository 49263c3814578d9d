// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Integration tests for actor pools driven from a core worker.

mod common;

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ray_core_worker::batch::{Batch, BatchInferenceActor, JsonLinesShardReader, Model};
use ray_core_worker::{ActorError, ActorPool, CoreWorkerError, JobPayload, PoolActor};
use ray_test_utils::test_temp_dir;
use ray_test_utils::wait::{measure, wait_for_count};

use common::TestCluster;

/// Sleeps for a fixed time per job while tracking how many jobs run at once.
struct Sleeper {
    duration: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl PoolActor for Sleeper {
    type Input = u32;
    type Output = u32;

    async fn call(&mut self, input: u32) -> Result<u32, ActorError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.duration).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(input)
    }
}

fn sleepers(n: usize, duration: Duration) -> (Vec<Sleeper>, Arc<AtomicUsize>) {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    let actors = (0..n)
        .map(|_| Sleeper {
            duration,
            in_flight: in_flight.clone(),
            max_in_flight: max_in_flight.clone(),
        })
        .collect();
    (actors, max_in_flight)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_never_oversubscribes() {
    let (actors, max_in_flight) = sleepers(3, Duration::from_millis(20));
    let mut pool = ActorPool::new(actors, 64, None).unwrap();
    for n in 0..20 {
        pool.submit(JobPayload::Value(n)).unwrap();
    }
    let stats = pool.stats();
    assert!(stats.assigned <= 3, "{stats:?}");
    // Every worker picks up a job while the rest stay queued.
    assert!(wait_for_count(&max_in_flight, 3, Duration::from_secs(2)).await);
    assert_eq!(pool.stats().live, 3);
    let mut seen = Vec::new();
    while pool.has_next() {
        seen.push(pool.get_next_unordered(None).await.unwrap());
    }
    seen.sort();
    assert_eq!(seen, (0..20).collect::<Vec<_>>());
    assert!(max_in_flight.load(Ordering::SeqCst) <= 3);
}

/// Sleeps for as many milliseconds as its input.
struct Napper;

#[async_trait::async_trait]
impl PoolActor for Napper {
    type Input = u64;
    type Output = u64;

    async fn call(&mut self, millis: u64) -> Result<u64, ActorError> {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(millis)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unordered_results_follow_completion_order() {
    let mut pool = ActorPool::new(vec![Napper, Napper, Napper], 8, None).unwrap();
    for millis in [400, 200, 20] {
        pool.submit(JobPayload::Value(millis)).unwrap();
    }
    let mut finished = Vec::new();
    while pool.has_next() {
        finished.push(pool.get_next_unordered(None).await.unwrap());
    }
    assert_eq!(finished, vec![20, 200, 400]);

    // Submission order is still available on request.
    let ordered = pool.map([300, 10].into_iter().map(JobPayload::Value)).await;
    assert_eq!(ordered, vec![Ok(300), Ok(10)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_twelve_jobs_on_three_workers_take_four_rounds() {
    let job_time = Duration::from_millis(100);
    let (actors, max_in_flight) = sleepers(3, job_time);
    let mut pool = ActorPool::new(actors, 64, None).unwrap();
    let (results, elapsed) = measure(pool.map((0..12).map(JobPayload::Value))).await;
    assert_eq!(
        results.into_iter().map(Result::unwrap).collect::<Vec<_>>(),
        (0..12).collect::<Vec<_>>()
    );
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 3);
    assert!(elapsed >= job_time * 4, "{elapsed:?}");
    assert!(elapsed < job_time * 8, "{elapsed:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handle_payloads_resolve_by_value() {
    let cluster = TestCluster::new(1, 0);
    let driver = &cluster.driver;
    let (actors, _) = sleepers(2, Duration::from_millis(1));
    let mut pool = ActorPool::for_worker(driver, actors).unwrap();

    let small = driver.put(&17u32).unwrap();
    pool.submit(small.clone()).unwrap();
    pool.submit(JobPayload::Value(3)).unwrap();
    assert_eq!(pool.get_next(None).await.unwrap(), 17);
    assert_eq!(pool.get_next(None).await.unwrap(), 3);

    // A payload that does not decode fails the job, not the worker.
    let text = driver.put("not a number").unwrap();
    pool.submit(text).unwrap();
    assert!(matches!(
        pool.get_next(None).await,
        Err(CoreWorkerError::Serialization(_))
    ));
    drop(small);
    assert_eq!(pool.stats().live, 2);
}

struct Flaky;

#[async_trait::async_trait]
impl PoolActor for Flaky {
    type Input = i32;
    type Output = i32;

    async fn call(&mut self, input: i32) -> Result<i32, ActorError> {
        match input {
            0 => Err(ActorError::Fatal("out of device memory".into())),
            n if n < 0 => Err(ActorError::Application(format!("rejected {n}"))),
            n => Ok(n),
        }
    }
}

#[tokio::test]
async fn test_lost_worker_leaves_pool_running() {
    let mut pool = ActorPool::new(vec![Flaky, Flaky], 16, None).unwrap();
    let results = pool
        .map([1, -1, 0, 2].into_iter().map(JobPayload::Value))
        .await;
    assert_eq!(results[0], Ok(1));
    assert_eq!(
        results[1],
        Err(CoreWorkerError::TaskFailed {
            message: "rejected -1".into()
        })
    );
    assert!(matches!(results[2], Err(CoreWorkerError::WorkerLost { .. })));
    assert_eq!(results[3], Ok(2));
    assert_eq!(pool.stats().live, 1);

    // The last worker goes too; the pool then refuses work.
    pool.submit(JobPayload::Value(0)).unwrap();
    assert!(matches!(
        pool.get_next(Some(Duration::from_secs(5))).await,
        Err(CoreWorkerError::WorkerLost { .. })
    ));
    assert!(matches!(
        pool.submit(JobPayload::Value(1)),
        Err(CoreWorkerError::NoAvailableWorkers)
    ));
}

struct AddOne;

impl Model for AddOne {
    fn apply(&self, batch: Batch) -> Result<Batch, String> {
        let scores = batch
            .column("feature")
            .ok_or_else(|| "missing feature column".to_string())?
            .iter()
            .map(|value| value + 1.0)
            .collect();
        batch.with_column("score", scores).map_err(|err| err.to_string())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_inference_over_shards() {
    let dir = test_temp_dir();
    let shards: Vec<PathBuf> = (0..4)
        .map(|i| {
            let path = dir.path().join(format!("shard-{i}.jsonl"));
            let mut file = std::fs::File::create(&path).unwrap();
            for row in 0..3 {
                writeln!(file, "{{\"feature\": {}}}", i * 10 + row).unwrap();
            }
            path
        })
        .collect();

    let reader = Arc::new(JsonLinesShardReader);
    let actors = (0..2)
        .map(|_| BatchInferenceActor::new(reader.clone(), Box::new(AddOne)))
        .collect();
    let mut pool = ActorPool::new(actors, 8, None).unwrap();
    let outputs = pool.map(shards.into_iter().map(JobPayload::Value)).await;
    for (i, output) in outputs.into_iter().enumerate() {
        let batch = output.unwrap();
        let base = (i * 10) as f64;
        assert_eq!(
            batch.column("score"),
            Some(&[base + 1.0, base + 2.0, base + 3.0][..])
        );
    }
}
