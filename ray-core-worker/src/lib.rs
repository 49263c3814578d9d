// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Core worker logic.
//!
//! Handles object put/get with size-based placement, ownership and
//! borrowing of object references, task submission with by-value and
//! by-reference argument passing, and pools of stateful actors.

pub mod error;
pub mod options;
pub mod context;
pub mod serialization;
pub mod memory_store;
pub mod reference_counter;
pub mod object_ref;
pub mod client;
pub mod task_spec;
pub mod dependency_resolver;
pub mod normal_task_submitter;
pub mod core_worker;
pub mod cluster;
pub mod actor_pool;
pub mod batch;

// Re-export primary types.
pub use actor_pool::{ActorError, ActorPool, JobPayload, PoolActor, PoolStats};
pub use cluster::{global_cluster, global_driver, init_global_driver, ClusterRuntime};
pub use core_worker::CoreWorker;
pub use error::{CoreWorkerError, CoreWorkerResult};
pub use memory_store::{ObjectLocation, ObjectState};
pub use object_ref::ObjectRef;
pub use options::{CoreWorkerOptions, WorkerType};
pub use serialization::RayObject;
pub use task_spec::{remote_fn, ArgContainer, RemoteFunction, ResolvedArg, TaskArg};
