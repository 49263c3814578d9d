// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Core worker configuration options.

use std::sync::Arc;

use ray_common::config::RayConfig;
use ray_common::id::{NodeID, WorkerID};

/// The role of a worker in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerType {
    /// Executes tasks submitted by other workers.
    Worker,
    /// The process that started the job and submits its top-level work.
    Driver,
}

impl WorkerType {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerType::Worker => "worker",
            WorkerType::Driver => "driver",
        }
    }
}

/// Options for initializing a CoreWorker.
#[derive(Debug, Clone)]
pub struct CoreWorkerOptions {
    pub worker_type: WorkerType,
    pub worker_id: WorkerID,
    pub node_id: NodeID,
    pub config: Arc<RayConfig>,
}

impl CoreWorkerOptions {
    pub fn new(worker_type: WorkerType, node_id: NodeID, config: Arc<RayConfig>) -> Self {
        Self {
            worker_type,
            worker_id: WorkerID::from_random(),
            node_id,
            config,
        }
    }
}

impl Default for CoreWorkerOptions {
    fn default() -> Self {
        Self::new(
            WorkerType::Worker,
            NodeID::nil(),
            Arc::new(RayConfig::default()),
        )
    }
}
