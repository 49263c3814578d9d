// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Dependency resolution for task arguments.
//!
//! Runs on the executing worker. Direct handles are fetched and replaced by
//! their values; nested handles are only rebound to the executing worker,
//! which registers it as a borrower with each owner.

use ray_util::time::Stopwatch;

use crate::core_worker::CoreWorker;
use crate::error::CoreWorkerResult;
use crate::task_spec::{ResolvedArg, TaskArg};

pub struct DependencyResolver;

impl DependencyResolver {
    /// Resolve the arguments of a task in the context of `worker`.
    pub async fn resolve_args(
        worker: &CoreWorker,
        args: &[TaskArg],
    ) -> CoreWorkerResult<Vec<ResolvedArg>> {
        let stopwatch = Stopwatch::new();
        let mut resolved = Vec::with_capacity(args.len());
        let mut num_fetched = 0usize;
        for arg in args {
            resolved.push(match arg {
                TaskArg::Value(object) => ResolvedArg::Value(object.clone()),
                TaskArg::Direct(handle) => {
                    let local = worker.borrow(handle)?;
                    num_fetched += 1;
                    ResolvedArg::Value(worker.get_object(&local, None).await?)
                }
                TaskArg::Nested(container) => {
                    ResolvedArg::Nested(container.try_map_refs(&mut |handle| worker.borrow(handle))?)
                }
            });
        }
        if num_fetched > 0 {
            tracing::trace!(
                worker_id = %worker.worker_id(),
                num_fetched,
                elapsed_ms = stopwatch.elapsed_ms(),
                "Resolved direct task arguments"
            );
        }
        Ok(resolved)
    }
}
