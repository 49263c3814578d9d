// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! In-process object store for the core worker.
//!
//! Holds one record per object this worker knows a value for. Small values
//! live here inline; promoted values leave a placeholder naming the node
//! whose shared store holds the bytes, so lookups work the same way for
//! both placements.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;

use ray_common::id::{NodeID, ObjectID};

use crate::error::{CoreWorkerError, CoreWorkerResult};
use crate::serialization::RayObject;

/// Where the value of an object lives, seen from this worker's node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectLocation {
    /// Inline in this process.
    Local,
    /// In the shared store of this worker's node.
    SharedLocal,
    /// In the shared store of another node.
    SharedRemote(NodeID),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Created by a task that has not finished.
    Pending,
    Ready,
    /// The only shared copy went away with its node.
    Evicted,
    Freed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    Inline(RayObject),
    /// The value was promoted to the shared store of `node_id`.
    Placeholder { node_id: NodeID },
    /// The producing task failed; the record carries its error.
    Error(RayObject),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    pub object_id: ObjectID,
    pub location: ObjectLocation,
    pub size: u64,
    pub value: Option<StoredValue>,
    pub state: ObjectState,
}

impl ObjectRecord {
    fn pending(object_id: ObjectID) -> Self {
        Self {
            object_id,
            location: ObjectLocation::Local,
            size: 0,
            value: None,
            state: ObjectState::Pending,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == ObjectState::Ready
    }

    pub fn is_promoted(&self) -> bool {
        matches!(self.value, Some(StoredValue::Placeholder { .. }))
    }
}

/// Thread-safe in-process memory store for Ray objects.
pub struct CoreWorkerMemoryStore {
    self_node_id: NodeID,
    objects: Mutex<HashMap<ObjectID, ObjectRecord>>,
    /// Woken on every state change.
    notify: Notify,
}

impl CoreWorkerMemoryStore {
    pub fn new(self_node_id: NodeID) -> Self {
        Self {
            self_node_id,
            objects: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    /// Reserve a record for a value that a running task will produce.
    pub fn add_pending(&self, object_id: ObjectID) -> CoreWorkerResult<()> {
        let mut objects = self.objects.lock();
        if objects.contains_key(&object_id) {
            return Err(CoreWorkerError::Internal(format!(
                "object {object_id} already has a record"
            )));
        }
        objects.insert(object_id, ObjectRecord::pending(object_id));
        Ok(())
    }

    /// Store a small value inline.
    pub fn put_inline(&self, object_id: ObjectID, object: RayObject) -> CoreWorkerResult<()> {
        let size = object.size();
        self.complete(object_id, ObjectLocation::Local, size, StoredValue::Inline(object))
    }

    /// Record that the value was promoted to the shared store of `node_id`.
    pub fn put_placeholder(
        &self,
        object_id: ObjectID,
        node_id: NodeID,
        size: u64,
    ) -> CoreWorkerResult<()> {
        let location = self.location_of(node_id);
        self.complete(object_id, location, size, StoredValue::Placeholder { node_id })
    }

    /// Record the failure of the task producing `object_id`.
    pub fn put_error(&self, object_id: ObjectID, error: RayObject) -> CoreWorkerResult<()> {
        let size = error.size();
        self.complete(object_id, ObjectLocation::Local, size, StoredValue::Error(error))
    }

    fn complete(
        &self,
        object_id: ObjectID,
        location: ObjectLocation,
        size: u64,
        value: StoredValue,
    ) -> CoreWorkerResult<()> {
        {
            let mut objects = self.objects.lock();
            let record = objects
                .entry(object_id)
                .or_insert_with(|| ObjectRecord::pending(object_id));
            if record.state != ObjectState::Pending {
                return Err(CoreWorkerError::Internal(format!(
                    "object {object_id} was already completed"
                )));
            }
            record.location = location;
            record.size = size;
            record.value = Some(value);
            record.state = ObjectState::Ready;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Point a promoted object at another node holding a copy.
    pub fn relocate(&self, object_id: &ObjectID, node_id: NodeID) -> bool {
        let location = self.location_of(node_id);
        let mut objects = self.objects.lock();
        match objects.get_mut(object_id) {
            Some(record) if record.is_promoted() => {
                record.value = Some(StoredValue::Placeholder { node_id });
                record.location = location;
                record.state = ObjectState::Ready;
                true
            }
            _ => false,
        }
    }

    /// Mark promoted objects whose only copy was on `node_id` as evicted.
    pub fn mark_evicted(&self, object_ids: &[ObjectID], node_id: &NodeID) {
        {
            let mut objects = self.objects.lock();
            for object_id in object_ids {
                if let Some(record) = objects.get_mut(object_id) {
                    if record.value == Some(StoredValue::Placeholder { node_id: *node_id }) {
                        record.state = ObjectState::Evicted;
                    }
                }
            }
        }
        self.notify.notify_waiters();
    }

    /// Drop the record, returning it in its final `Freed` state.
    pub fn free(&self, object_id: &ObjectID) -> Option<ObjectRecord> {
        let record = self.objects.lock().remove(object_id);
        self.notify.notify_waiters();
        record.map(|mut record| {
            record.state = ObjectState::Freed;
            record
        })
    }

    pub fn get(&self, object_id: &ObjectID) -> Option<ObjectRecord> {
        self.objects.lock().get(object_id).cloned()
    }

    pub fn contains(&self, object_id: &ObjectID) -> bool {
        self.objects.lock().contains_key(object_id)
    }

    /// Number of records in the store.
    pub fn size(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn num_pending(&self) -> usize {
        self.objects
            .lock()
            .values()
            .filter(|record| record.state == ObjectState::Pending)
            .count()
    }

    /// Wait until the record leaves `Pending`, or until `deadline`.
    ///
    /// A timed-out wait leaves the record untouched; a later call may still
    /// see it complete.
    pub async fn get_or_wait(
        &self,
        object_id: &ObjectID,
        deadline: Option<Instant>,
    ) -> CoreWorkerResult<ObjectRecord> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a completion in between is not lost.
            notified.as_mut().enable();

            match self.get(object_id) {
                None => return Err(CoreWorkerError::UnknownObject(*object_id)),
                Some(record) if record.state != ObjectState::Pending => return Ok(record),
                Some(_) => {}
            }

            match deadline {
                Some(deadline) => {
                    let deadline = tokio::time::Instant::from_std(deadline);
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(CoreWorkerError::GetTimeout(format!(
                            "waiting for object {object_id}"
                        )));
                    }
                }
                None => notified.await,
            }
        }
    }

    fn location_of(&self, node_id: NodeID) -> ObjectLocation {
        if node_id == self.self_node_id {
            ObjectLocation::SharedLocal
        } else {
            ObjectLocation::SharedRemote(node_id)
        }
    }
}
