// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! In-process cluster: nodes, workers and the directory routing messages
//! between them.
//!
//! [`ClusterRuntime`] is the composition root. It is the only place that
//! knows every node and worker; components below it receive explicit
//! handles. The process-wide driver created by [`init_global_driver`] is the
//! single global.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use parking_lot::RwLock;

use ray_common::config::RayConfig;
use ray_common::id::{NodeID, ObjectID, WorkerID};
use ray_object_manager::common::ObjectManagerConfig;
use ray_object_manager::object_manager::ObjectManager;
use ray_object_manager::transport::InProcessTransport;

use crate::client::{OwnedObjectStatus, OwnerClient, RayletClient};
use crate::context::OwnerAddress;
use crate::core_worker::CoreWorker;
use crate::error::{CoreWorkerError, CoreWorkerResult};
use crate::options::{CoreWorkerOptions, WorkerType};

/// Routes owner and node messages to live workers and nodes.
#[derive(Default)]
struct ClusterDirectory {
    nodes: RwLock<HashMap<NodeID, Arc<ObjectManager>>>,
    /// Registration order, used for round-robin leasing.
    workers: RwLock<Vec<(WorkerID, Weak<CoreWorker>)>>,
    next_lease: AtomicUsize,
}

impl ClusterDirectory {
    fn live_worker(&self, worker_id: &WorkerID) -> Option<Arc<CoreWorker>> {
        self.workers
            .read()
            .iter()
            .find(|(id, _)| id == worker_id)
            .and_then(|(_, worker)| worker.upgrade())
            .filter(|worker| worker.is_alive())
    }

    fn owner(&self, owner: &OwnerAddress, object_id: &ObjectID) -> CoreWorkerResult<Arc<CoreWorker>> {
        self.live_worker(&owner.worker_id)
            .ok_or(CoreWorkerError::OwnerUnreachable {
                object_id: *object_id,
                owner: owner.worker_id,
            })
    }
}

#[async_trait::async_trait]
impl OwnerClient for ClusterDirectory {
    async fn get_object_status(
        &self,
        owner: &OwnerAddress,
        object_id: &ObjectID,
        deadline: Option<Instant>,
    ) -> CoreWorkerResult<OwnedObjectStatus> {
        let worker = self.owner(owner, object_id)?;
        match worker.handle_get_object_status(object_id, deadline).await {
            // The owner dropped its records while we waited.
            Err(CoreWorkerError::UnknownObject(_)) if !worker.is_alive() => {
                Err(CoreWorkerError::OwnerUnreachable {
                    object_id: *object_id,
                    owner: owner.worker_id,
                })
            }
            other => other,
        }
    }

    fn peek_object_status(
        &self,
        owner: &OwnerAddress,
        object_id: &ObjectID,
    ) -> CoreWorkerResult<Option<OwnedObjectStatus>> {
        self.owner(owner, object_id)?
            .handle_peek_object_status(object_id)
    }

    fn add_borrower(
        &self,
        owner: &OwnerAddress,
        object_id: &ObjectID,
        borrower: WorkerID,
    ) -> CoreWorkerResult<()> {
        self.owner(owner, object_id)?
            .handle_add_borrower(object_id, borrower)
    }

    fn remove_borrower(
        &self,
        owner: &OwnerAddress,
        object_id: &ObjectID,
        borrower: WorkerID,
    ) -> CoreWorkerResult<()> {
        self.owner(owner, object_id)?
            .handle_remove_borrower(object_id, borrower)
    }

    fn add_object_location(
        &self,
        owner: &OwnerAddress,
        object_id: &ObjectID,
        node_id: NodeID,
    ) -> CoreWorkerResult<()> {
        self.owner(owner, object_id)?
            .handle_add_object_location(object_id, node_id)
    }

    fn is_owner_alive(&self, owner: &OwnerAddress) -> bool {
        self.live_worker(&owner.worker_id).is_some()
    }
}

impl RayletClient for ClusterDirectory {
    fn lease_worker(&self) -> CoreWorkerResult<Arc<CoreWorker>> {
        let candidates: Vec<Arc<CoreWorker>> = self
            .workers
            .read()
            .iter()
            .filter_map(|(_, worker)| worker.upgrade())
            .filter(|worker| worker.is_alive() && worker.worker_type() == WorkerType::Worker)
            .collect();
        if candidates.is_empty() {
            return Err(CoreWorkerError::NoAvailableWorkers);
        }
        let index = self.next_lease.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Ok(candidates[index].clone())
    }

    fn free_objects(&self, node_id: &NodeID, object_ids: &[ObjectID]) {
        let Some(manager) = self.nodes.read().get(node_id).cloned() else {
            return;
        };
        for (object_id, err) in manager.free_objects(object_ids) {
            tracing::debug!(object_id = %object_id, node_id = %node_id, error = %err, "Shared copy not freed");
        }
    }
}

/// An in-process cluster of nodes, each with a shared store, and the
/// workers running on them.
pub struct ClusterRuntime {
    config: Arc<RayConfig>,
    transport: Arc<InProcessTransport>,
    directory: Arc<ClusterDirectory>,
    workers: RwLock<HashMap<WorkerID, Arc<CoreWorker>>>,
}

impl ClusterRuntime {
    pub fn new(config: RayConfig) -> CoreWorkerResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config: Arc::new(config),
            transport: InProcessTransport::new(),
            directory: Arc::new(ClusterDirectory::default()),
            workers: RwLock::new(HashMap::new()),
        }))
    }

    pub fn config(&self) -> &Arc<RayConfig> {
        &self.config
    }

    // ─── Nodes ───────────────────────────────────────────────────────

    /// Start a node with its own shared store.
    pub fn add_node(&self) -> NodeID {
        let node_id = NodeID::from_random();
        let manager = ObjectManager::new(
            node_id,
            ObjectManagerConfig::from(self.config.as_ref()),
            self.transport.clone(),
        );
        self.transport.register(&manager);
        self.directory.nodes.write().insert(node_id, manager);
        tracing::info!(node_id = %node_id, "Node added");
        node_id
    }

    pub fn object_manager(&self, node_id: &NodeID) -> Option<Arc<ObjectManager>> {
        self.directory.nodes.read().get(node_id).cloned()
    }

    pub fn node_ids(&self) -> Vec<NodeID> {
        self.directory.nodes.read().keys().copied().collect()
    }

    /// Remove a node. Its workers die, and the shared copies it held are
    /// gone: owners move to another copy or mark the object evicted.
    pub fn remove_node(&self, node_id: &NodeID) -> bool {
        if self.directory.nodes.write().remove(node_id).is_none() {
            return false;
        }
        self.transport.unregister(node_id);
        let on_node: Vec<WorkerID> = self
            .workers
            .read()
            .values()
            .filter(|worker| worker.node_id() == *node_id)
            .map(|worker| worker.worker_id())
            .collect();
        for worker_id in &on_node {
            self.kill_worker(worker_id);
        }
        for worker in self.live_workers() {
            worker.handle_node_removed(node_id);
        }
        tracing::info!(node_id = %node_id, num_workers_lost = on_node.len(), "Node removed");
        true
    }

    // ─── Workers ─────────────────────────────────────────────────────

    pub fn spawn_worker(
        &self,
        node_id: &NodeID,
        worker_type: WorkerType,
    ) -> CoreWorkerResult<Arc<CoreWorker>> {
        let manager = self.object_manager(node_id).ok_or_else(|| {
            CoreWorkerError::InvalidArgument(format!("node {node_id} is not part of the cluster"))
        })?;
        let options = CoreWorkerOptions::new(worker_type, *node_id, self.config.clone());
        let worker = CoreWorker::new(
            options,
            manager,
            self.directory.clone(),
            self.directory.clone(),
        );
        self.directory
            .workers
            .write()
            .push((worker.worker_id(), Arc::downgrade(&worker)));
        self.workers
            .write()
            .insert(worker.worker_id(), worker.clone());
        Ok(worker)
    }

    /// Kill a worker. Objects it owned become unreachable for their
    /// borrowers, and the borrows it held are released.
    pub fn kill_worker(&self, worker_id: &WorkerID) -> bool {
        let Some(worker) = self.workers.write().remove(worker_id) else {
            return false;
        };
        self.directory
            .workers
            .write()
            .retain(|(id, _)| id != worker_id);
        worker.shutdown();
        for other in self.live_workers() {
            other.handle_worker_died(worker_id);
        }
        tracing::warn!(worker_id = %worker_id, node_id = %worker.node_id(), "Worker killed");
        true
    }

    pub fn worker(&self, worker_id: &WorkerID) -> Option<Arc<CoreWorker>> {
        self.workers.read().get(worker_id).cloned()
    }

    pub fn live_workers(&self) -> Vec<Arc<CoreWorker>> {
        self.workers.read().values().cloned().collect()
    }

    pub fn num_workers(&self) -> usize {
        self.workers.read().len()
    }
}

// ─── Global driver ───────────────────────────────────────────────────

struct GlobalDriver {
    cluster: Arc<ClusterRuntime>,
    driver: Arc<CoreWorker>,
}

static GLOBAL_DRIVER: OnceLock<GlobalDriver> = OnceLock::new();

/// Start a single-node cluster with `num_workers` task workers and a driver,
/// and install the driver as the process-wide default.
pub fn init_global_driver(config: RayConfig, num_workers: usize) -> CoreWorkerResult<Arc<CoreWorker>> {
    if GLOBAL_DRIVER.get().is_some() {
        return Err(CoreWorkerError::InvalidArgument(
            "global driver is already initialized".into(),
        ));
    }
    let cluster = ClusterRuntime::new(config)?;
    let node_id = cluster.add_node();
    for _ in 0..num_workers {
        cluster.spawn_worker(&node_id, WorkerType::Worker)?;
    }
    let driver = cluster.spawn_worker(&node_id, WorkerType::Driver)?;
    GLOBAL_DRIVER
        .set(GlobalDriver {
            cluster,
            driver: driver.clone(),
        })
        .map_err(|_| {
            CoreWorkerError::InvalidArgument("global driver is already initialized".into())
        })?;
    Ok(driver)
}

pub fn global_driver() -> Option<Arc<CoreWorker>> {
    GLOBAL_DRIVER.get().map(|global| global.driver.clone())
}

pub fn global_cluster() -> Option<Arc<ClusterRuntime>> {
    GLOBAL_DRIVER.get().map(|global| global.cluster.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> RayConfig {
        RayConfig {
            object_store_memory: 64 * 1024 * 1024,
            ..RayConfig::default()
        }
    }

    #[test]
    fn test_spawn_worker_requires_node() {
        let cluster = ClusterRuntime::new(small_config()).unwrap();
        assert!(matches!(
            cluster.spawn_worker(&NodeID::from_random(), WorkerType::Worker),
            Err(CoreWorkerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_lease_round_robin_skips_drivers() {
        let cluster = ClusterRuntime::new(small_config()).unwrap();
        let node = cluster.add_node();
        assert!(matches!(
            cluster.directory.lease_worker(),
            Err(CoreWorkerError::NoAvailableWorkers)
        ));
        let driver = cluster.spawn_worker(&node, WorkerType::Driver).unwrap();
        let a = cluster.spawn_worker(&node, WorkerType::Worker).unwrap();
        let b = cluster.spawn_worker(&node, WorkerType::Worker).unwrap();
        let leased: Vec<WorkerID> = (0..4)
            .map(|_| cluster.directory.lease_worker().unwrap().worker_id())
            .collect();
        assert_eq!(
            leased,
            vec![a.worker_id(), b.worker_id(), a.worker_id(), b.worker_id()]
        );
        assert!(!leased.contains(&driver.worker_id()));
    }

    #[test]
    fn test_kill_worker_makes_owner_unreachable() {
        let cluster = ClusterRuntime::new(small_config()).unwrap();
        let node = cluster.add_node();
        let worker = cluster.spawn_worker(&node, WorkerType::Worker).unwrap();
        let address = worker.address();
        assert!(cluster.directory.is_owner_alive(&address));
        assert!(cluster.kill_worker(&worker.worker_id()));
        assert!(!cluster.kill_worker(&worker.worker_id()));
        assert!(!cluster.directory.is_owner_alive(&address));
        assert!(!worker.is_alive());
        assert_eq!(cluster.num_workers(), 0);
    }

    #[test]
    fn test_remove_node_kills_its_workers() {
        let cluster = ClusterRuntime::new(small_config()).unwrap();
        let doomed = cluster.add_node();
        let survivor = cluster.add_node();
        let lost = cluster.spawn_worker(&doomed, WorkerType::Worker).unwrap();
        let kept = cluster.spawn_worker(&survivor, WorkerType::Worker).unwrap();
        assert!(cluster.remove_node(&doomed));
        assert!(!cluster.remove_node(&doomed));
        assert!(!lost.is_alive());
        assert!(kept.is_alive());
        assert_eq!(cluster.node_ids(), vec![survivor]);
    }
}
