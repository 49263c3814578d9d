// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Normal (non-actor) task submission.
//!
//! The submitting worker owns the return object of every task it submits.
//! A task runs on a leased worker; its return value comes back by value
//! when small, or stays in the executing node's shared store with the
//! owner holding a placeholder.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;

use ray_common::id::{NodeID, ObjectID};

use crate::client::RayletClient;
use crate::error::{CoreWorkerError, CoreWorkerResult};
use crate::memory_store::CoreWorkerMemoryStore;
use crate::reference_counter::ReferenceCounter;
use crate::serialization::RayObject;
use crate::task_spec::TaskSpec;

/// The value a finished task hands back to the owner of its return object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskReturn {
    Inline(RayObject),
    Promoted { node_id: NodeID, size: u64 },
}

/// The message recorded for a failed task.
pub fn failure_message(err: &CoreWorkerError) -> String {
    match err {
        CoreWorkerError::TaskFailed { message } => message.clone(),
        other => other.to_string(),
    }
}

/// Submitter for normal (non-actor) tasks.
pub struct NormalTaskSubmitter {
    reference_counter: Arc<ReferenceCounter>,
    memory_store: Arc<CoreWorkerMemoryStore>,
    raylet_client: Arc<dyn RayletClient>,
    /// Bounds the number of tasks executing at once.
    semaphore: Arc<Semaphore>,
    pending_tasks: Arc<AtomicUsize>,
}

impl NormalTaskSubmitter {
    pub fn new(
        reference_counter: Arc<ReferenceCounter>,
        memory_store: Arc<CoreWorkerMemoryStore>,
        raylet_client: Arc<dyn RayletClient>,
        max_pending_tasks: usize,
    ) -> Self {
        Self {
            reference_counter,
            memory_store,
            raylet_client,
            semaphore: Arc::new(Semaphore::new(max_pending_tasks.max(1))),
            pending_tasks: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Submit a task whose return object is already registered as pending.
    ///
    /// Returns once the task is queued; its arguments stay pinned until it
    /// finishes.
    pub fn submit_task(&self, spec: TaskSpec) -> CoreWorkerResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| CoreWorkerError::Internal(format!("no async runtime: {err}")))?;
        let dependencies = spec.dependencies();
        self.reference_counter
            .add_submitted_task_references(&dependencies)?;
        self.pending_tasks.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            task = spec.name(),
            return_id = %spec.return_id,
            num_dependencies = dependencies.len(),
            "Task submitted"
        );

        let reference_counter = self.reference_counter.clone();
        let memory_store = self.memory_store.clone();
        let raylet_client = self.raylet_client.clone();
        let semaphore = self.semaphore.clone();
        let pending_tasks = self.pending_tasks.clone();
        runtime.spawn(async move {
            let outcome = match semaphore.acquire_owned().await {
                Ok(_permit) => execute(raylet_client.as_ref(), &spec).await,
                Err(_) => Err(CoreWorkerError::Internal("task dispatcher closed".into())),
            };
            let return_id = spec.return_id;
            // Releases the argument handles held by the task.
            drop(spec);
            complete_task(
                &reference_counter,
                &memory_store,
                raylet_client.as_ref(),
                return_id,
                outcome,
            );
            reference_counter.remove_submitted_task_references(&dependencies);
            pending_tasks.fetch_sub(1, Ordering::Relaxed);
        });
        Ok(())
    }

    /// Number of submitted tasks that have not finished.
    pub fn num_pending_tasks(&self) -> usize {
        self.pending_tasks.load(Ordering::Relaxed)
    }
}

async fn execute(raylet_client: &dyn RayletClient, spec: &TaskSpec) -> CoreWorkerResult<TaskReturn> {
    let executor = raylet_client.lease_worker()?;
    tracing::debug!(
        task = spec.name(),
        executor = %executor.worker_id(),
        node_id = %executor.node_id(),
        "Leased worker for task"
    );
    executor.execute_task(spec).await
}

fn complete_task(
    reference_counter: &ReferenceCounter,
    memory_store: &CoreWorkerMemoryStore,
    raylet_client: &dyn RayletClient,
    return_id: ObjectID,
    outcome: CoreWorkerResult<TaskReturn>,
) {
    if !reference_counter.contains(&return_id) {
        // Every handle to the return value was dropped while the task ran.
        if let Ok(TaskReturn::Promoted { node_id, .. }) = &outcome {
            raylet_client.free_objects(node_id, &[return_id]);
        }
        tracing::debug!(return_id = %return_id, "Discarding result of unreferenced task");
        return;
    }
    let stored = match outcome {
        Ok(TaskReturn::Inline(object)) => memory_store.put_inline(return_id, object),
        Ok(TaskReturn::Promoted { node_id, size }) => {
            reference_counter.add_object_location(&return_id, node_id);
            memory_store.put_placeholder(return_id, node_id, size)
        }
        Err(err) => {
            tracing::warn!(return_id = %return_id, error = %err, "Task failed");
            memory_store.put_error(return_id, RayObject::task_error(&failure_message(&err)))
        }
    };
    if let Err(err) = stored {
        tracing::error!(return_id = %return_id, error = %err, "Failed to store task result");
    }
}
