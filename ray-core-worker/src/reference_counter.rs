// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Object reference counting for the core worker.
//!
//! Each worker tracks the objects it holds handles to. For objects it owns,
//! the entry is authoritative: local handle copies, borrowing workers and
//! in-flight task arguments all keep the object alive, and the object is
//! freed exactly once when the last of them goes away. For borrowed
//! objects the entry only counts local handles; dropping the last one
//! tells the owner that this worker stopped borrowing.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use ray_common::id::{NodeID, ObjectID, WorkerID};

use crate::context::OwnerAddress;
use crate::error::{CoreWorkerError, CoreWorkerResult};

/// Counts other than local handles. Changed under the entry lock.
#[derive(Debug, Default)]
struct SharedRefs {
    /// Registrations per borrowing worker. A count rather than a set so that
    /// a re-borrow racing with the previous unregister stays balanced.
    borrowers: HashMap<WorkerID, u32>,
    submitted_task_refs: u64,
    /// Nodes holding a sealed copy in their shared store.
    locations: HashSet<NodeID>,
}

#[derive(Debug)]
struct Reference {
    owner: OwnerAddress,
    owned: bool,
    local_ref_count: AtomicU64,
    shared: Mutex<SharedRefs>,
}

impl Reference {
    fn new(owner: OwnerAddress, owned: bool) -> Self {
        Self {
            owner,
            owned,
            local_ref_count: AtomicU64::new(1),
            shared: Mutex::new(SharedRefs::default()),
        }
    }

    fn is_unreferenced(&self) -> bool {
        if self.local_ref_count.load(Ordering::Acquire) > 0 {
            return false;
        }
        let shared = self.shared.lock();
        shared.borrowers.is_empty() && shared.submitted_task_refs == 0
    }
}

/// Snapshot of one tracked object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceInfo {
    pub object_id: ObjectID,
    pub owner: OwnerAddress,
    pub owned: bool,
    pub local_ref_count: u64,
    pub num_borrowers: usize,
    pub submitted_task_refs: u64,
    pub locations: Vec<NodeID>,
}

/// An object whose last reference went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreedObject {
    pub object_id: ObjectID,
    pub owner: OwnerAddress,
    pub owned: bool,
    pub locations: Vec<NodeID>,
}

pub type FreedCallback = Box<dyn Fn(FreedObject) + Send + Sync>;

/// Tracks reference counts for objects in the core worker.
pub struct ReferenceCounter {
    self_address: OwnerAddress,
    refs: DashMap<ObjectID, Reference>,
    /// Recently freed objects, so that a late release is reported as a
    /// double free instead of an unknown object.
    freed: Mutex<LruCache<ObjectID, ()>>,
    on_freed: RwLock<Option<FreedCallback>>,
}

impl ReferenceCounter {
    pub fn new(self_address: OwnerAddress, tombstone_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(tombstone_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            self_address,
            refs: DashMap::new(),
            freed: Mutex::new(LruCache::new(capacity)),
            on_freed: RwLock::new(None),
        }
    }

    /// Install the hook that releases an object's storage once it is freed.
    pub fn set_on_freed(&self, callback: FreedCallback) {
        *self.on_freed.write() = Some(callback);
    }

    // ─── Registration ───────────────────────────────────────────────

    /// Track a new object owned by this worker, with one local reference
    /// held by the handle returned to the creator.
    pub fn add_owned_object(&self, object_id: ObjectID) -> CoreWorkerResult<()> {
        match self.refs.entry(object_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(CoreWorkerError::Internal(
                format!("object {object_id} is already tracked"),
            )),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Reference::new(self.self_address, true));
                Ok(())
            }
        }
    }

    /// Add one local reference to an object owned by another worker.
    ///
    /// Returns `true` when this worker was not borrowing the object before,
    /// in which case the caller must register with the owner.
    pub fn add_borrowed_object(&self, object_id: ObjectID, owner: OwnerAddress) -> bool {
        match self.refs.entry(object_id) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                entry.get().local_ref_count.fetch_add(1, Ordering::AcqRel);
                false
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Reference::new(owner, false));
                self.freed.lock().pop(&object_id);
                true
            }
        }
    }

    // ─── Local references ───────────────────────────────────────────

    /// Increment the local reference count of a tracked object.
    pub fn acquire(&self, object_id: &ObjectID) -> CoreWorkerResult<()> {
        let entry = self
            .refs
            .get(object_id)
            .ok_or(CoreWorkerError::UnknownObject(*object_id))?;
        entry.local_ref_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Decrement the local reference count, freeing the object if nothing
    /// else references it. Releasing a count that is already zero, or an
    /// object that was freed, is a `DoubleFree`.
    pub fn release(&self, object_id: &ObjectID) -> CoreWorkerResult<()> {
        let reached_zero = {
            let entry = self
                .refs
                .get(object_id)
                .ok_or_else(|| self.missing(object_id))?;
            let previous = entry
                .local_ref_count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                    count.checked_sub(1)
                })
                .map_err(|_| CoreWorkerError::DoubleFree(*object_id))?;
            previous == 1
        };
        if reached_zero {
            self.try_free(object_id);
        }
        Ok(())
    }

    // ─── Borrowers and in-flight tasks ──────────────────────────────

    /// Register another worker as a borrower of an owned object.
    pub fn add_borrower(&self, object_id: &ObjectID, borrower: WorkerID) -> CoreWorkerResult<()> {
        let entry = self.owned_entry(object_id)?;
        *entry.shared.lock().borrowers.entry(borrower).or_insert(0) += 1;
        tracing::debug!(object_id = %object_id, borrower = %borrower, "Added borrower");
        Ok(())
    }

    pub fn remove_borrower(
        &self,
        object_id: &ObjectID,
        borrower: WorkerID,
    ) -> CoreWorkerResult<()> {
        {
            let entry = self.owned_entry(object_id)?;
            let mut shared = entry.shared.lock();
            match shared.borrowers.get_mut(&borrower) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    shared.borrowers.remove(&borrower);
                }
                None => {
                    return Err(CoreWorkerError::InvalidArgument(format!(
                        "worker {borrower} is not borrowing object {object_id}"
                    )))
                }
            }
        }
        tracing::debug!(object_id = %object_id, borrower = %borrower, "Removed borrower");
        self.try_free(object_id);
        Ok(())
    }

    /// Drop every registration of a borrower that died. Returns the number
    /// of objects it was borrowing.
    pub fn remove_dead_borrower(&self, borrower: &WorkerID) -> usize {
        let affected: Vec<ObjectID> = self
            .refs
            .iter()
            .filter_map(|entry| {
                entry
                    .shared
                    .lock()
                    .borrowers
                    .remove(borrower)
                    .map(|_| *entry.key())
            })
            .collect();
        for object_id in &affected {
            self.try_free(object_id);
        }
        affected.len()
    }

    /// Pin objects passed as task arguments until the task finishes.
    pub fn add_submitted_task_references(&self, object_ids: &[ObjectID]) -> CoreWorkerResult<()> {
        for (i, object_id) in object_ids.iter().enumerate() {
            match self.refs.get(object_id) {
                Some(entry) => entry.shared.lock().submitted_task_refs += 1,
                None => {
                    self.remove_submitted_task_references(&object_ids[..i]);
                    return Err(CoreWorkerError::UnknownObject(*object_id));
                }
            }
        }
        Ok(())
    }

    pub fn remove_submitted_task_references(&self, object_ids: &[ObjectID]) {
        for object_id in object_ids {
            let found = match self.refs.get(object_id) {
                Some(entry) => {
                    let mut shared = entry.shared.lock();
                    shared.submitted_task_refs = shared.submitted_task_refs.saturating_sub(1);
                    true
                }
                None => false,
            };
            if found {
                self.try_free(object_id);
            } else {
                tracing::warn!(object_id = %object_id, "Finished task referenced an untracked object");
            }
        }
    }

    // ─── Locations ──────────────────────────────────────────────────

    /// Record that `node_id` holds a sealed copy. Returns `false` if the
    /// object is no longer tracked.
    pub fn add_object_location(&self, object_id: &ObjectID, node_id: NodeID) -> bool {
        match self.refs.get(object_id) {
            Some(entry) => {
                entry.shared.lock().locations.insert(node_id);
                true
            }
            None => false,
        }
    }

    pub fn remove_object_location(&self, object_id: &ObjectID, node_id: &NodeID) -> bool {
        self.refs
            .get(object_id)
            .map(|entry| entry.shared.lock().locations.remove(node_id))
            .unwrap_or(false)
    }

    pub fn object_locations(&self, object_id: &ObjectID) -> Vec<NodeID> {
        self.refs
            .get(object_id)
            .map(|entry| entry.shared.lock().locations.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Owned objects with a copy on `node_id`.
    pub fn owned_objects_at(&self, node_id: &NodeID) -> Vec<ObjectID> {
        self.refs
            .iter()
            .filter(|entry| entry.owned && entry.shared.lock().locations.contains(node_id))
            .map(|entry| *entry.key())
            .collect()
    }

    // ─── Queries ────────────────────────────────────────────────────

    /// Look up the ownership record of an object.
    pub fn resolve(&self, object_id: &ObjectID) -> CoreWorkerResult<ReferenceInfo> {
        let entry = self
            .refs
            .get(object_id)
            .ok_or(CoreWorkerError::UnknownObject(*object_id))?;
        let shared = entry.shared.lock();
        Ok(ReferenceInfo {
            object_id: *object_id,
            owner: entry.owner,
            owned: entry.owned,
            local_ref_count: entry.local_ref_count.load(Ordering::Acquire),
            num_borrowers: shared.borrowers.len(),
            submitted_task_refs: shared.submitted_task_refs,
            locations: shared.locations.iter().copied().collect(),
        })
    }

    pub fn owner_of(&self, object_id: &ObjectID) -> Option<OwnerAddress> {
        self.refs.get(object_id).map(|entry| entry.owner)
    }

    pub fn is_owned(&self, object_id: &ObjectID) -> bool {
        self.refs
            .get(object_id)
            .map(|entry| entry.owned)
            .unwrap_or(false)
    }

    pub fn contains(&self, object_id: &ObjectID) -> bool {
        self.refs.contains_key(object_id)
    }

    pub fn was_freed(&self, object_id: &ObjectID) -> bool {
        self.freed.lock().contains(object_id)
    }

    pub fn local_ref_count(&self, object_id: &ObjectID) -> u64 {
        self.refs
            .get(object_id)
            .map(|entry| entry.local_ref_count.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn owned_objects(&self) -> Vec<ObjectID> {
        self.refs
            .iter()
            .filter(|entry| entry.owned)
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn num_objects(&self) -> usize {
        self.refs.len()
    }

    // ─── Internals ──────────────────────────────────────────────────

    fn owned_entry(
        &self,
        object_id: &ObjectID,
    ) -> CoreWorkerResult<dashmap::mapref::one::Ref<'_, ObjectID, Reference>> {
        match self.refs.get(object_id) {
            Some(entry) if entry.owned => Ok(entry),
            Some(_) => Err(CoreWorkerError::InvalidArgument(format!(
                "object {object_id} is not owned by worker {}",
                self.self_address.worker_id
            ))),
            None => Err(CoreWorkerError::UnknownObject(*object_id)),
        }
    }

    fn missing(&self, object_id: &ObjectID) -> CoreWorkerError {
        if self.was_freed(object_id) {
            CoreWorkerError::DoubleFree(*object_id)
        } else {
            CoreWorkerError::UnknownObject(*object_id)
        }
    }

    /// Remove the entry if nothing references it. `remove_if` holds the
    /// shard write lock while checking, so a concurrent `acquire` either
    /// happens before (and keeps the entry) or finds nothing.
    fn try_free(&self, object_id: &ObjectID) {
        let Some((_, reference)) = self
            .refs
            .remove_if(object_id, |_, reference| reference.is_unreferenced())
        else {
            return;
        };
        self.freed.lock().put(*object_id, ());
        let freed = FreedObject {
            object_id: *object_id,
            owner: reference.owner,
            owned: reference.owned,
            locations: reference.shared.into_inner().locations.into_iter().collect(),
        };
        tracing::debug!(
            object_id = %object_id,
            owned = freed.owned,
            num_locations = freed.locations.len(),
            "Object freed"
        );
        if let Some(callback) = self.on_freed.read().as_ref() {
            callback(freed);
        }
    }
}
