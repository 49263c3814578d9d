// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The pool's dispatch loop.
//!
//! Jobs wait in the bounded submission channel until a worker is idle; the
//! loop takes one job at a time, so a job is only ever assigned to an idle
//! worker and arrival order is kept. Each assigned job runs as its own
//! task that owns the worker until the job ends.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};

use crate::core_worker::CoreWorker;
use crate::error::{CoreWorkerError, CoreWorkerResult};

use super::worker::{run_job, FinishedJob, JobExit, PoolWorker, PoolWorkerId, QueuedJob};
use super::{JobId, PoolActor, PoolState};

/// A finished job on its way back to the pool's caller.
pub(super) struct JobCompletion<O> {
    pub(super) job_id: JobId,
    pub(super) result: CoreWorkerResult<O>,
}

pub(super) struct Scheduler<A: PoolActor> {
    jobs: mpsc::Receiver<QueuedJob<A::Input>>,
    completions: mpsc::UnboundedSender<JobCompletion<A::Output>>,
    idle: VecDeque<PoolWorker<A>>,
    running: JoinSet<FinishedJob<A>>,
    /// Running task → (worker, job), to attribute panics.
    assignments: HashMap<tokio::task::Id, (PoolWorkerId, JobId)>,
    resolver: Option<Arc<CoreWorker>>,
    state: Arc<PoolState>,
}

impl<A: PoolActor> Scheduler<A> {
    pub(super) fn new(
        workers: Vec<PoolWorker<A>>,
        jobs: mpsc::Receiver<QueuedJob<A::Input>>,
        completions: mpsc::UnboundedSender<JobCompletion<A::Output>>,
        resolver: Option<Arc<CoreWorker>>,
        state: Arc<PoolState>,
    ) -> Self {
        Self {
            jobs,
            completions,
            idle: workers.into(),
            running: JoinSet::new(),
            assignments: HashMap::new(),
            resolver,
            state,
        }
    }

    /// Run until the pool handle is dropped and every assigned job ended.
    pub(super) async fn run(mut self) {
        let mut accepting = true;
        loop {
            if !accepting && self.running.is_empty() {
                break;
            }
            // With no worker at all, queued jobs are drained and failed.
            let can_take_job = accepting && (!self.idle.is_empty() || self.running.is_empty());
            tokio::select! {
                biased;
                Some(joined) = self.running.join_next(), if !self.running.is_empty() => {
                    self.on_job_exit(joined);
                }
                job = self.jobs.recv(), if can_take_job => match job {
                    Some(job) => self.dispatch(job),
                    None => accepting = false,
                },
            }
        }
        tracing::debug!(live = self.idle.len(), "Pool scheduler stopped");
    }

    fn dispatch(&mut self, job: QueuedJob<A::Input>) {
        self.state.queued.fetch_sub(1, Ordering::Relaxed);
        let Some(worker) = self.idle.pop_front() else {
            self.complete(job.job_id, Err(CoreWorkerError::NoAvailableWorkers));
            return;
        };
        self.state.idle.fetch_sub(1, Ordering::Relaxed);
        self.state.assigned.fetch_add(1, Ordering::Relaxed);
        let worker_id = worker.id;
        let job_id = job.job_id;
        tracing::debug!(job_id = %job_id, worker = %worker_id, "Pool job assigned");
        let task = self
            .running
            .spawn(run_job(worker, job, self.resolver.clone()));
        self.assignments.insert(task.id(), (worker_id, job_id));
    }

    fn on_job_exit(&mut self, joined: Result<FinishedJob<A>, JoinError>) {
        self.state.assigned.fetch_sub(1, Ordering::Relaxed);
        match joined {
            Ok(FinishedJob { job_id, worker, exit }) => {
                self.assignments.retain(|_, (_, id)| *id != job_id);
                match exit {
                    JobExit::Done(result) => {
                        self.idle.push_back(worker);
                        self.state.idle.fetch_add(1, Ordering::Relaxed);
                        self.complete(job_id, result);
                    }
                    JobExit::Crashed(message) => self.lose_worker(worker.id, job_id, message),
                }
            }
            Err(err) => {
                let Some((worker_id, job_id)) = self.assignments.remove(&err.id()) else {
                    tracing::error!(error = %err, "Untracked pool job ended abnormally");
                    return;
                };
                let message = if err.is_panic() {
                    format!("actor panicked: {}", panic_message(err))
                } else {
                    "job was cancelled".to_string()
                };
                self.lose_worker(worker_id, job_id, message);
            }
        }
    }

    fn lose_worker(&mut self, worker_id: PoolWorkerId, job_id: JobId, message: String) {
        let live = self.state.live.fetch_sub(1, Ordering::Relaxed) - 1;
        tracing::warn!(
            worker = %worker_id,
            job_id = %job_id,
            live,
            reason = %message,
            "Pool worker lost"
        );
        self.complete(
            job_id,
            Err(CoreWorkerError::WorkerLost {
                worker: worker_id.to_string(),
                message,
            }),
        );
    }

    fn complete(&self, job_id: JobId, result: CoreWorkerResult<A::Output>) {
        // The pool handle may already be gone; nobody is left to read it.
        let _ = self.completions.send(JobCompletion { job_id, result });
    }
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(err) => err.to_string(),
    }
}
