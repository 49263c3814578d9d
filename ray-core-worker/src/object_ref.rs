// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Object handles.
//!
//! An [`ObjectRef`] is bound to the reference counter of the worker that
//! holds it. Cloning adds a local reference; dropping removes one. A handle
//! crosses to another worker only through [`crate::CoreWorker::borrow`],
//! which rebinds it to the receiving worker and registers that worker with
//! the owner.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use ray_common::id::{ObjectID, WorkerID};

use crate::context::OwnerAddress;
use crate::reference_counter::ReferenceCounter;

pub struct ObjectRef {
    object_id: ObjectID,
    owner: OwnerAddress,
    tracker: Weak<ReferenceCounter>,
}

impl ObjectRef {
    /// Wrap a reference the tracker has already counted.
    pub(crate) fn from_counted(
        object_id: ObjectID,
        owner: OwnerAddress,
        tracker: &Arc<ReferenceCounter>,
    ) -> Self {
        Self {
            object_id,
            owner,
            tracker: Arc::downgrade(tracker),
        }
    }

    pub fn object_id(&self) -> ObjectID {
        self.object_id
    }

    pub fn owner(&self) -> OwnerAddress {
        self.owner
    }

    pub fn owner_worker_id(&self) -> WorkerID {
        self.owner.worker_id
    }

    pub(crate) fn is_bound_to(&self, tracker: &Arc<ReferenceCounter>) -> bool {
        std::ptr::eq(self.tracker.as_ptr(), Arc::as_ptr(tracker))
    }

    /// Give up the handle without releasing its reference. The count must
    /// later be returned with [`crate::CoreWorker::release`].
    pub fn into_object_id(mut self) -> ObjectID {
        self.tracker = Weak::new();
        self.object_id
    }
}

impl Clone for ObjectRef {
    fn clone(&self) -> Self {
        if let Some(tracker) = self.tracker.upgrade() {
            if let Err(err) = tracker.acquire(&self.object_id) {
                tracing::error!(object_id = %self.object_id, error = %err, "Cloned a handle to an untracked object");
            }
        }
        Self {
            object_id: self.object_id,
            owner: self.owner,
            tracker: self.tracker.clone(),
        }
    }
}

impl Drop for ObjectRef {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.upgrade() {
            if let Err(err) = tracker.release(&self.object_id) {
                tracing::error!(object_id = %self.object_id, error = %err, "Failed to release object reference");
            }
        }
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.object_id == other.object_id
    }
}

impl Eq for ObjectRef {}

impl Hash for ObjectRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.object_id.hash(state);
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("object_id", &self.object_id)
            .field("owner", &self.owner.worker_id)
            .finish()
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({})", self.object_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ray_common::id::NodeID;

    fn make_tracker() -> Arc<ReferenceCounter> {
        let address = OwnerAddress::new(WorkerID::from_random(), NodeID::from_random());
        Arc::new(ReferenceCounter::new(address, 8))
    }

    fn make_ref(tracker: &Arc<ReferenceCounter>) -> ObjectRef {
        let oid = ObjectID::from_random();
        tracker.add_owned_object(oid).unwrap();
        let owner = OwnerAddress::new(WorkerID::from_random(), NodeID::nil());
        ObjectRef::from_counted(oid, owner, tracker)
    }

    #[test]
    fn test_clone_and_drop_track_count() {
        let tracker = make_tracker();
        let handle = make_ref(&tracker);
        let oid = handle.object_id();
        let copy = handle.clone();
        assert_eq!(copy, handle);
        assert_eq!(tracker.local_ref_count(&oid), 2);
        drop(handle);
        assert_eq!(tracker.local_ref_count(&oid), 1);
        drop(copy);
        assert!(!tracker.contains(&oid));
        assert!(tracker.was_freed(&oid));
    }

    #[test]
    fn test_into_object_id_keeps_count() {
        let tracker = make_tracker();
        let handle = make_ref(&tracker);
        let oid = handle.into_object_id();
        assert_eq!(tracker.local_ref_count(&oid), 1);
        tracker.release(&oid).unwrap();
        assert!(!tracker.contains(&oid));
    }

    #[test]
    fn test_handle_outliving_tracker() {
        let tracker = make_tracker();
        let handle = make_ref(&tracker);
        assert!(handle.is_bound_to(&tracker));
        drop(tracker);
        let copy = handle.clone();
        drop(handle);
        drop(copy);
    }
}
