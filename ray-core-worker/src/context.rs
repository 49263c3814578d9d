// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Per-worker context: identity and the object index counter.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ray_common::id::{NodeID, ObjectID, WorkerID};

use crate::options::WorkerType;

/// Identity of the worker that owns an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerAddress {
    pub worker_id: WorkerID,
    pub node_id: NodeID,
}

impl OwnerAddress {
    pub fn new(worker_id: WorkerID, node_id: NodeID) -> Self {
        Self { worker_id, node_id }
    }
}

/// Per-worker state shared by every component of one core worker.
pub struct WorkerContext {
    worker_type: WorkerType,
    worker_id: WorkerID,
    node_id: NodeID,
    object_index: AtomicU64,
    alive: AtomicBool,
}

impl WorkerContext {
    pub fn new(worker_type: WorkerType, worker_id: WorkerID, node_id: NodeID) -> Self {
        Self {
            worker_type,
            worker_id,
            node_id,
            object_index: AtomicU64::new(0),
            alive: AtomicBool::new(true),
        }
    }

    pub fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    pub fn worker_id(&self) -> WorkerID {
        self.worker_id
    }

    pub fn node_id(&self) -> NodeID {
        self.node_id
    }

    pub fn address(&self) -> OwnerAddress {
        OwnerAddress::new(self.worker_id, self.node_id)
    }

    /// Allocate a fresh object ID for a put or a task return. Indices start
    /// at 1 and are never reused.
    pub fn next_object_id(&self) -> ObjectID {
        let index = self.object_index.fetch_add(1, Ordering::Relaxed) + 1;
        ObjectID::from_index(&self.worker_id, index)
    }

    pub fn num_objects_created(&self) -> u64 {
        self.object_index.load(Ordering::Relaxed)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Returns `true` if this call performed the transition.
    pub fn mark_dead(&self) -> bool {
        self.alive
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
