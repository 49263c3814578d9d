// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Object manager: one per node.
//!
//! Owns the node's plasma store and pull manager, and serves reads of its
//! sealed objects to other nodes.

use std::sync::Arc;

use bytes::Bytes;
use ray_common::id::{NodeID, ObjectID};

use crate::common::{ObjectInfo, ObjectManagerConfig, ObjectSource, PlasmaError};
use crate::plasma::allocator::PlasmaAllocator;
use crate::plasma::store::{PlasmaObjectView, PlasmaStore};
use crate::pull_manager::{PullError, PullManager};
use crate::transport::{ObjectTransport, TransferError};

pub struct ObjectManager {
    self_node_id: NodeID,
    config: ObjectManagerConfig,
    plasma_store: Arc<PlasmaStore>,
    pull_manager: PullManager,
}

impl ObjectManager {
    pub fn new(
        self_node_id: NodeID,
        config: ObjectManagerConfig,
        transport: Arc<dyn ObjectTransport>,
    ) -> Arc<Self> {
        let allocator = Arc::new(PlasmaAllocator::new(config.object_store_memory));
        let plasma_store = Arc::new(PlasmaStore::new(allocator));
        let pull_manager =
            PullManager::new(self_node_id, config.clone(), plasma_store.clone(), transport);
        tracing::info!(
            node_id = %self_node_id,
            capacity = config.object_store_memory,
            chunk_size = config.object_chunk_size,
            "Object manager started"
        );
        Arc::new(Self {
            self_node_id,
            config,
            plasma_store,
            pull_manager,
        })
    }

    pub fn node_id(&self) -> NodeID {
        self.self_node_id
    }

    pub fn config(&self) -> &ObjectManagerConfig {
        &self.config
    }

    pub fn plasma_store(&self) -> &Arc<PlasmaStore> {
        &self.plasma_store
    }

    pub fn pull_manager(&self) -> &PullManager {
        &self.pull_manager
    }

    /// Write a promoted object into this node's region.
    pub fn put_object(
        &self,
        info: ObjectInfo,
        data: &[u8],
        metadata: &[u8],
    ) -> Result<PlasmaObjectView, PlasmaError> {
        self.plasma_store
            .create_and_seal(info, ObjectSource::CreatedByWorker, data, metadata)
    }

    /// A local sealed copy, if any.
    pub fn get_local(&self, object_id: &ObjectID) -> Option<PlasmaObjectView> {
        self.plasma_store.get(object_id)
    }

    /// A local copy of the object, pulling it from `from` if this node does
    /// not hold one yet.
    pub async fn get_or_pull(
        &self,
        object_id: ObjectID,
        from: NodeID,
    ) -> Result<PlasmaObjectView, PullError> {
        if from == self.self_node_id {
            return self
                .plasma_store
                .get(&object_id)
                .ok_or(PullError::ObjectLost {
                    object_id,
                    node_id: from,
                });
        }
        self.pull_manager.pull(object_id, from).await
    }

    /// Release the local copies of the given objects. Missing objects are
    /// skipped; pinned ones are reported back.
    pub fn free_objects(&self, object_ids: &[ObjectID]) -> Vec<(ObjectID, PlasmaError)> {
        let mut failed = Vec::new();
        for object_id in object_ids {
            match self.plasma_store.delete_object(object_id) {
                Ok(()) | Err(PlasmaError::ObjectNonexistent) => {}
                Err(err) => failed.push((*object_id, err)),
            }
        }
        failed
    }

    pub(crate) fn serve_object_info(&self, object_id: &ObjectID) -> Result<ObjectInfo, TransferError> {
        self.plasma_store
            .get_object_info(object_id)
            .ok_or(TransferError::ObjectNotFound {
                object_id: *object_id,
                node_id: self.self_node_id,
            })
    }

    pub(crate) fn serve_chunk(
        &self,
        object_id: &ObjectID,
        offset: u64,
        len: u64,
    ) -> Result<Bytes, TransferError> {
        self.plasma_store
            .get(object_id)
            .map(|view| view.read_range(offset, len))
            .ok_or(TransferError::ObjectNotFound {
                object_id: *object_id,
                node_id: self.self_node_id,
            })
    }
}
