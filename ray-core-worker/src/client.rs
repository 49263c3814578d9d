// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Traits for the messages a core worker sends to other workers and nodes.
//!
//! Ownership crosses worker boundaries only through these explicit
//! messages: a borrower registers and unregisters with the owner, asks it
//! for the status of an object, and reports new copies it created.

use std::sync::Arc;
use std::time::Instant;

use ray_common::id::{NodeID, ObjectID, WorkerID};

use crate::context::OwnerAddress;
use crate::core_worker::CoreWorker;
use crate::error::CoreWorkerResult;
use crate::serialization::RayObject;

/// What the owner knows about a finished object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnedObjectStatus {
    /// Small value, returned by value.
    Inline(RayObject),
    /// Promoted value held in the shared store of `node_id`.
    Promoted { node_id: NodeID, size: u64 },
    /// The producing task failed.
    Failed(RayObject),
}

/// Messages from a borrower to the owner of an object.
#[async_trait::async_trait]
pub trait OwnerClient: Send + Sync {
    // ── Object status ─────────────────────────────────────────────
    /// Wait until the object is ready at its owner, or until `deadline`.
    async fn get_object_status(
        &self,
        owner: &OwnerAddress,
        object_id: &ObjectID,
        deadline: Option<Instant>,
    ) -> CoreWorkerResult<OwnedObjectStatus>;

    /// Current status without waiting; `None` while the object is pending.
    fn peek_object_status(
        &self,
        owner: &OwnerAddress,
        object_id: &ObjectID,
    ) -> CoreWorkerResult<Option<OwnedObjectStatus>>;

    // ── Borrowing ─────────────────────────────────────────────────
    fn add_borrower(
        &self,
        owner: &OwnerAddress,
        object_id: &ObjectID,
        borrower: WorkerID,
    ) -> CoreWorkerResult<()>;

    fn remove_borrower(
        &self,
        owner: &OwnerAddress,
        object_id: &ObjectID,
        borrower: WorkerID,
    ) -> CoreWorkerResult<()>;

    // ── Locations ─────────────────────────────────────────────────
    /// Report a new sealed copy on `node_id`.
    fn add_object_location(
        &self,
        owner: &OwnerAddress,
        object_id: &ObjectID,
        node_id: NodeID,
    ) -> CoreWorkerResult<()>;

    fn is_owner_alive(&self, owner: &OwnerAddress) -> bool;
}

/// Messages from a worker to the node layer.
pub trait RayletClient: Send + Sync {
    /// Pick a live worker to execute a task.
    fn lease_worker(&self) -> CoreWorkerResult<Arc<CoreWorker>>;

    /// Release the shared store copies of freed objects on `node_id`.
    fn free_objects(&self, node_id: &NodeID, object_ids: &[ObjectID]);
}
