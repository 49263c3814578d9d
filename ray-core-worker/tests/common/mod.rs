// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! In-process cluster fixture for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use ray_common::config::RayConfig;
use ray_common::id::NodeID;
use ray_core_worker::{ClusterRuntime, CoreWorker, WorkerType};

pub const TEST_THRESHOLD: u64 = 100_000;

pub struct TestCluster {
    pub runtime: Arc<ClusterRuntime>,
    pub nodes: Vec<NodeID>,
    /// The driver, on the first node.
    pub driver: Arc<CoreWorker>,
}

impl TestCluster {
    /// `num_nodes` nodes with `workers_per_node` task workers each.
    pub fn new(num_nodes: usize, workers_per_node: usize) -> Self {
        Self::with_config(num_nodes, workers_per_node, test_config(TEST_THRESHOLD))
    }

    pub fn with_config(num_nodes: usize, workers_per_node: usize, config: RayConfig) -> Self {
        ray_test_utils::init_test_logging();
        let runtime = ClusterRuntime::new(config).unwrap();
        let nodes: Vec<NodeID> = (0..num_nodes).map(|_| runtime.add_node()).collect();
        for node in &nodes {
            for _ in 0..workers_per_node {
                runtime.spawn_worker(node, WorkerType::Worker).unwrap();
            }
        }
        let driver = runtime.spawn_worker(&nodes[0], WorkerType::Driver).unwrap();
        Self {
            runtime,
            nodes,
            driver,
        }
    }

    /// Another driver-style worker on `node`, for cross-worker scenarios.
    pub fn client_on(&self, node: usize) -> Arc<CoreWorker> {
        self.runtime
            .spawn_worker(&self.nodes[node], WorkerType::Driver)
            .unwrap()
    }
}

pub fn test_config(threshold: u64) -> RayConfig {
    RayConfig {
        max_direct_call_object_size: threshold,
        object_store_memory: 64 * 1024 * 1024,
        object_chunk_size: 64 * 1024,
        ..RayConfig::default()
    }
}
