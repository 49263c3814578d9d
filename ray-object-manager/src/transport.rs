// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Node-to-node object transfer.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::RwLock;
use ray_common::id::{NodeID, ObjectID};

use crate::common::ObjectInfo;
use crate::object_manager::ObjectManager;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("node {0} is unreachable")]
    NodeUnreachable(NodeID),
    #[error("object {object_id} is not sealed on node {node_id}")]
    ObjectNotFound { object_id: ObjectID, node_id: NodeID },
    #[error("transient transfer failure: {0}")]
    Transient(String),
}

impl TransferError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ObjectNotFound { .. })
    }
}

/// Reads sealed objects held by other nodes.
#[async_trait::async_trait]
pub trait ObjectTransport: Send + Sync {
    async fn get_object_info(
        &self,
        node_id: &NodeID,
        object_id: &ObjectID,
    ) -> Result<ObjectInfo, TransferError>;

    /// Read `len` bytes starting at `offset` of the object's data followed
    /// by its metadata.
    async fn read_chunk(
        &self,
        node_id: &NodeID,
        object_id: &ObjectID,
        offset: u64,
        len: u64,
    ) -> Result<Bytes, TransferError>;
}

/// Transport between object managers living in the same process.
///
/// Holds weak references so that a node going away is observed as
/// `NodeUnreachable` rather than kept alive by its peers.
#[derive(Default)]
pub struct InProcessTransport {
    nodes: RwLock<HashMap<NodeID, Weak<ObjectManager>>>,
}

impl InProcessTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, manager: &Arc<ObjectManager>) {
        self.nodes
            .write()
            .insert(manager.node_id(), Arc::downgrade(manager));
    }

    pub fn unregister(&self, node_id: &NodeID) -> bool {
        self.nodes.write().remove(node_id).is_some()
    }

    pub fn is_registered(&self, node_id: &NodeID) -> bool {
        self.lookup(node_id).is_ok()
    }

    fn lookup(&self, node_id: &NodeID) -> Result<Arc<ObjectManager>, TransferError> {
        self.nodes
            .read()
            .get(node_id)
            .and_then(Weak::upgrade)
            .ok_or(TransferError::NodeUnreachable(*node_id))
    }
}

#[async_trait::async_trait]
impl ObjectTransport for InProcessTransport {
    async fn get_object_info(
        &self,
        node_id: &NodeID,
        object_id: &ObjectID,
    ) -> Result<ObjectInfo, TransferError> {
        self.lookup(node_id)?.serve_object_info(object_id)
    }

    async fn read_chunk(
        &self,
        node_id: &NodeID,
        object_id: &ObjectID,
        offset: u64,
        len: u64,
    ) -> Result<Bytes, TransferError> {
        self.lookup(node_id)?.serve_chunk(object_id, offset, len)
    }
}
