// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Pool of stateful actors.
//!
//! Jobs are submitted without waiting, queued in arrival order, and run on
//! the next idle actor; each actor runs at most one job at a time.
//! Completions are read back with [`ActorPool::get_next`] (submission order)
//! or [`ActorPool::get_next_unordered`] (completion order).
//!
//! A job whose actor returns [`ActorError::Application`] fails alone and the
//! actor stays in the pool. [`ActorError::Fatal`] or a panic loses the
//! actor for good; the job fails with `WorkerLost`.

mod scheduler;
mod worker;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::core_worker::CoreWorker;
use crate::error::{CoreWorkerError, CoreWorkerResult};
use crate::object_ref::ObjectRef;

use scheduler::{JobCompletion, Scheduler};
use worker::{PoolWorker, QueuedJob};

pub use worker::PoolWorkerId;

/// Error returned by an actor for one job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActorError {
    /// The job failed; the actor is still usable.
    #[error("{0}")]
    Application(String),
    /// The actor's resources are gone; it must not run further jobs.
    #[error("fatal actor failure: {0}")]
    Fatal(String),
}

/// A stateful worker in an [`ActorPool`].
#[async_trait::async_trait]
pub trait PoolActor: Send + 'static {
    type Input: DeserializeOwned + Send + 'static;
    type Output: Send + 'static;

    async fn call(&mut self, input: Self::Input) -> Result<Self::Output, ActorError>;
}

/// What a job runs on: a value, or a handle resolved by value before the
/// actor sees it.
#[derive(Debug)]
pub enum JobPayload<I> {
    Value(I),
    Ref(ObjectRef),
}

impl<I> From<ObjectRef> for JobPayload<I> {
    fn from(handle: ObjectRef) -> Self {
        JobPayload::Ref(handle)
    }
}

/// Submission sequence number of a job within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Point-in-time counters of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub queued: usize,
    pub assigned: usize,
    pub idle: usize,
    pub live: usize,
}

#[derive(Default)]
struct PoolState {
    queued: AtomicUsize,
    assigned: AtomicUsize,
    idle: AtomicUsize,
    live: AtomicUsize,
}

pub struct ActorPool<A: PoolActor> {
    jobs: mpsc::Sender<QueuedJob<A::Input>>,
    completions: mpsc::UnboundedReceiver<JobCompletion<A::Output>>,
    state: Arc<PoolState>,
    max_queued_jobs: usize,
    next_job_id: u64,
    /// Oldest job not yet returned by `get_next`.
    next_ordered: u64,
    /// Completions received but not yet returned.
    buffered: HashMap<JobId, CoreWorkerResult<A::Output>>,
    /// Buffered jobs in the order they completed.
    arrivals: VecDeque<JobId>,
    /// Jobs returned by `get_next_unordered` ahead of `next_ordered`.
    returned_early: BTreeSet<JobId>,
}

impl<A: PoolActor> ActorPool<A> {
    /// Start a pool over `actors`. Handle payloads are resolved through
    /// `resolver`; without one they fail.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        actors: Vec<A>,
        max_queued_jobs: usize,
        resolver: Option<Arc<CoreWorker>>,
    ) -> CoreWorkerResult<Self> {
        if actors.is_empty() {
            return Err(CoreWorkerError::InvalidArgument(
                "an actor pool needs at least one actor".into(),
            ));
        }
        if max_queued_jobs == 0 {
            return Err(CoreWorkerError::InvalidArgument(
                "max_queued_jobs must be positive".into(),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| CoreWorkerError::Internal(format!("no async runtime: {err}")))?;

        let num_actors = actors.len();
        let state = Arc::new(PoolState::default());
        state.idle.store(num_actors, Ordering::Relaxed);
        state.live.store(num_actors, Ordering::Relaxed);

        let workers = actors
            .into_iter()
            .enumerate()
            .map(|(index, actor)| PoolWorker::new(PoolWorkerId(index), actor))
            .collect();
        let (jobs_tx, jobs_rx) = mpsc::channel(max_queued_jobs);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        runtime.spawn(Scheduler::new(workers, jobs_rx, completions_tx, resolver, state.clone()).run());
        tracing::info!(num_actors, max_queued_jobs, "Actor pool started");

        Ok(Self {
            jobs: jobs_tx,
            completions: completions_rx,
            state,
            max_queued_jobs,
            next_job_id: 0,
            next_ordered: 0,
            buffered: HashMap::new(),
            arrivals: VecDeque::new(),
            returned_early: BTreeSet::new(),
        })
    }

    /// Start a pool that resolves handle payloads through `worker`, with the
    /// queue bound taken from its config.
    pub fn for_worker(worker: &Arc<CoreWorker>, actors: Vec<A>) -> CoreWorkerResult<Self> {
        let max_queued_jobs = worker.config().actor_pool_max_queued_jobs;
        Self::new(actors, max_queued_jobs, Some(worker.clone()))
    }

    // ─── Submission ──────────────────────────────────────────────────

    /// Queue a job without waiting. Fails with `PoolSaturated` when the
    /// queue is full.
    pub fn submit(&mut self, payload: impl Into<JobPayload<A::Input>>) -> CoreWorkerResult<JobId> {
        self.ensure_workers()?;
        let job_id = JobId(self.next_job_id);
        self.state.queued.fetch_add(1, Ordering::Relaxed);
        let job = QueuedJob {
            job_id,
            payload: payload.into(),
        };
        match self.jobs.try_send(job) {
            Ok(()) => Ok(self.accepted(job_id)),
            Err(err) => {
                self.state.queued.fetch_sub(1, Ordering::Relaxed);
                match err {
                    TrySendError::Full(_) => Err(CoreWorkerError::PoolSaturated(self.max_queued_jobs)),
                    TrySendError::Closed(_) => Err(CoreWorkerError::Internal("actor pool scheduler stopped".into())),
                }
            }
        }
    }

    /// Queue a job, waiting for queue capacity if needed.
    pub async fn submit_async(
        &mut self,
        payload: impl Into<JobPayload<A::Input>>,
    ) -> CoreWorkerResult<JobId> {
        self.ensure_workers()?;
        let job_id = JobId(self.next_job_id);
        let permit = self
            .jobs
            .reserve()
            .await
            .map_err(|_| CoreWorkerError::Internal("actor pool scheduler stopped".into()))?;
        self.state.queued.fetch_add(1, Ordering::Relaxed);
        permit.send(QueuedJob {
            job_id,
            payload: payload.into(),
        });
        Ok(self.accepted(job_id))
    }

    fn accepted(&mut self, job_id: JobId) -> JobId {
        self.next_job_id += 1;
        tracing::debug!(job_id = %job_id, "Pool job queued");
        job_id
    }

    fn ensure_workers(&self) -> CoreWorkerResult<()> {
        if self.state.live.load(Ordering::Relaxed) == 0 {
            return Err(CoreWorkerError::NoAvailableWorkers);
        }
        Ok(())
    }

    // ─── Results ─────────────────────────────────────────────────────

    /// The result of the oldest job not yet returned. `None` blocks until
    /// it completes.
    pub async fn get_next(&mut self, timeout: Option<Duration>) -> CoreWorkerResult<A::Output> {
        self.skip_returned();
        if self.num_pending() == 0 {
            return Err(CoreWorkerError::NoPendingResults);
        }
        let wanted = JobId(self.next_ordered);
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        while !self.buffered.contains_key(&wanted) {
            self.receive(deadline, wanted).await?;
        }
        self.next_ordered += 1;
        self.arrivals.retain(|job_id| *job_id != wanted);
        self.buffered
            .remove(&wanted)
            .unwrap_or(Err(CoreWorkerError::NoPendingResults))
    }

    /// The result of whichever pending job completes first.
    pub async fn get_next_unordered(
        &mut self,
        timeout: Option<Duration>,
    ) -> CoreWorkerResult<A::Output> {
        if self.num_pending() == 0 {
            return Err(CoreWorkerError::NoPendingResults);
        }
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        if self.arrivals.is_empty() {
            self.receive(deadline, JobId(self.next_ordered)).await?;
        }
        let Some((job_id, result)) = self
            .arrivals
            .pop_front()
            .and_then(|job_id| self.buffered.remove(&job_id).map(|result| (job_id, result)))
        else {
            return Err(CoreWorkerError::NoPendingResults);
        };
        if job_id.0 == self.next_ordered {
            self.next_ordered += 1;
        } else {
            self.returned_early.insert(job_id);
        }
        self.skip_returned();
        result
    }

    async fn receive(
        &mut self,
        deadline: Option<tokio::time::Instant>,
        waiting_for: JobId,
    ) -> CoreWorkerResult<()> {
        let next = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.completions.recv())
                .await
                .map_err(|_| CoreWorkerError::GetTimeout(format!("waiting for pool {waiting_for}")))?,
            None => self.completions.recv().await,
        };
        let completion = next.ok_or_else(|| CoreWorkerError::Internal("actor pool scheduler stopped".into()))?;
        self.arrivals.push_back(completion.job_id);
        self.buffered.insert(completion.job_id, completion.result);
        Ok(())
    }

    fn skip_returned(&mut self) {
        while self.returned_early.remove(&JobId(self.next_ordered)) {
            self.next_ordered += 1;
        }
    }

    /// Submit every input and collect the results in input order.
    pub async fn map<I>(&mut self, inputs: I) -> Vec<CoreWorkerResult<A::Output>>
    where
        I: IntoIterator,
        I::Item: Into<JobPayload<A::Input>>,
    {
        let submitted = self.submit_all(inputs).await;
        let mut results = Vec::with_capacity(submitted.len());
        for outcome in submitted {
            results.push(match outcome {
                Ok(_) => self.get_next(None).await,
                Err(err) => Err(err),
            });
        }
        results
    }

    /// Submit every input and collect the results as they complete.
    pub async fn map_unordered<I>(&mut self, inputs: I) -> Vec<CoreWorkerResult<A::Output>>
    where
        I: IntoIterator,
        I::Item: Into<JobPayload<A::Input>>,
    {
        let submitted = self.submit_all(inputs).await;
        let mut results = Vec::with_capacity(submitted.len());
        for outcome in submitted {
            results.push(match outcome {
                Ok(_) => self.get_next_unordered(None).await,
                Err(err) => Err(err),
            });
        }
        results
    }

    async fn submit_all<I>(&mut self, inputs: I) -> Vec<CoreWorkerResult<JobId>>
    where
        I: IntoIterator,
        I::Item: Into<JobPayload<A::Input>>,
    {
        let mut submitted = Vec::new();
        for input in inputs {
            submitted.push(self.submit_async(input).await);
        }
        submitted
    }

    // ─── Introspection ───────────────────────────────────────────────

    /// Whether any submitted job has not been returned yet.
    pub fn has_next(&self) -> bool {
        self.num_pending() > 0
    }

    /// Whether a newly submitted job would start right away.
    pub fn has_free(&self) -> bool {
        self.state.idle.load(Ordering::Relaxed) > 0 && self.state.queued.load(Ordering::Relaxed) == 0
    }

    /// Submitted jobs whose results have not been returned.
    pub fn num_pending(&self) -> usize {
        (self.next_job_id - self.next_ordered) as usize - self.returned_early.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            queued: self.state.queued.load(Ordering::Relaxed),
            assigned: self.state.assigned.load(Ordering::Relaxed),
            idle: self.state.idle.load(Ordering::Relaxed),
            live: self.state.live.load(Ordering::Relaxed),
        }
    }
}
