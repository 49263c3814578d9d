// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Pool workers and the execution of a single job on one of them.

use std::fmt;
use std::sync::Arc;

use ray_util::time::Stopwatch;

use crate::core_worker::CoreWorker;
use crate::error::{CoreWorkerError, CoreWorkerResult};

use super::{ActorError, JobId, JobPayload, PoolActor};

/// Index of a worker within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolWorkerId(pub usize);

impl fmt::Display for PoolWorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool-worker-{}", self.0)
    }
}

/// A stateful worker. The actor is built once by the caller and reused for
/// every job the worker runs.
pub(super) struct PoolWorker<A> {
    pub(super) id: PoolWorkerId,
    pub(super) actor: A,
    pub(super) jobs_completed: u64,
}

impl<A> PoolWorker<A> {
    pub(super) fn new(id: PoolWorkerId, actor: A) -> Self {
        Self {
            id,
            actor,
            jobs_completed: 0,
        }
    }
}

/// A job as the scheduler sees it.
pub(super) struct QueuedJob<I> {
    pub(super) job_id: JobId,
    pub(super) payload: JobPayload<I>,
}

/// How a job left its worker.
pub(super) enum JobExit<O> {
    /// The worker can take another job. The job itself may have failed.
    Done(CoreWorkerResult<O>),
    /// The actor reported an unrecoverable failure.
    Crashed(String),
}

pub(super) struct FinishedJob<A: PoolActor> {
    pub(super) job_id: JobId,
    pub(super) worker: PoolWorker<A>,
    pub(super) exit: JobExit<A::Output>,
}

/// Run one job on `worker`, handing the worker back when done.
pub(super) async fn run_job<A: PoolActor>(
    mut worker: PoolWorker<A>,
    job: QueuedJob<A::Input>,
    resolver: Option<Arc<CoreWorker>>,
) -> FinishedJob<A> {
    let stopwatch = Stopwatch::new();
    let exit = match resolve_payload::<A>(job.payload, resolver.as_deref()).await {
        Err(err) => JobExit::Done(Err(err)),
        Ok(input) => match worker.actor.call(input).await {
            Ok(output) => JobExit::Done(Ok(output)),
            Err(ActorError::Application(message)) => {
                JobExit::Done(Err(CoreWorkerError::TaskFailed { message }))
            }
            Err(ActorError::Fatal(message)) => JobExit::Crashed(message),
        },
    };
    worker.jobs_completed += 1;
    tracing::debug!(
        job_id = %job.job_id,
        worker = %worker.id,
        elapsed_ms = stopwatch.elapsed_ms(),
        "Pool job finished"
    );
    FinishedJob {
        job_id: job.job_id,
        worker,
        exit,
    }
}

async fn resolve_payload<A: PoolActor>(
    payload: JobPayload<A::Input>,
    resolver: Option<&CoreWorker>,
) -> CoreWorkerResult<A::Input> {
    match payload {
        JobPayload::Value(input) => Ok(input),
        JobPayload::Ref(handle) => {
            let worker = resolver.ok_or_else(|| {
                CoreWorkerError::InvalidArgument(format!(
                    "job payload {} is a handle but the pool has no worker to resolve it",
                    handle.object_id()
                ))
            })?;
            worker.get(&handle, None).await
        }
    }
}
