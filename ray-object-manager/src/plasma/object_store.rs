// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Plasma object table: maps ObjectID to LocalObject.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use bytes::Bytes;
use ray_common::id::ObjectID;

use crate::common::{ObjectInfo, ObjectSource, PlasmaError};
use crate::plasma::allocator::Allocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Allocated; the single writer is filling it.
    Created = 1,
    /// Immutable and readable.
    Sealed = 2,
}

/// An object in the node's region.
#[derive(Debug)]
pub struct LocalObject {
    allocation: Allocation,
    object_info: ObjectInfo,
    /// Frozen payload, present once sealed.
    buffer: Option<Bytes>,
    /// Readers currently pinning the object.
    ref_count: u32,
    create_time: u64,
    construct_duration: Option<u64>,
    state: ObjectState,
    source: ObjectSource,
}

impl LocalObject {
    pub fn new(allocation: Allocation, object_info: ObjectInfo, source: ObjectSource) -> Self {
        Self {
            allocation,
            object_info,
            buffer: None,
            ref_count: 0,
            create_time: ray_util::time::current_time_ms(),
            construct_duration: None,
            state: ObjectState::Created,
            source,
        }
    }

    pub fn object_info(&self) -> &ObjectInfo {
        &self.object_info
    }

    pub fn object_id(&self) -> &ObjectID {
        &self.object_info.object_id
    }

    pub fn state(&self) -> ObjectState {
        self.state
    }

    pub fn is_sealed(&self) -> bool {
        self.state == ObjectState::Sealed
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn source(&self) -> ObjectSource {
        self.source
    }

    /// Milliseconds between creation and seal.
    pub fn construct_duration(&self) -> Option<u64> {
        self.construct_duration
    }

    pub fn object_size(&self) -> u64 {
        self.object_info.get_object_size()
    }

    /// The sealed payload (data followed by metadata).
    pub fn buffer(&self) -> Option<&Bytes> {
        self.buffer.as_ref()
    }

    fn seal(&mut self, buffer: Bytes) {
        self.buffer = Some(buffer);
        self.state = ObjectState::Sealed;
        self.construct_duration =
            Some(ray_util::time::current_time_ms().saturating_sub(self.create_time));
    }

    pub fn incr_ref(&mut self) {
        self.ref_count += 1;
    }

    /// Returns false if the object was not pinned.
    pub fn decr_ref(&mut self) -> bool {
        match self.ref_count.checked_sub(1) {
            Some(n) => {
                self.ref_count = n;
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ObjectStore {
    object_table: HashMap<ObjectID, LocalObject>,
    cumulative_created_bytes: u64,
    num_bytes_sealed: u64,
    num_bytes_unsealed: u64,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_object(
        &mut self,
        allocation: Allocation,
        object_info: ObjectInfo,
        source: ObjectSource,
    ) -> Result<&LocalObject, (PlasmaError, Allocation)> {
        let size = object_info.get_object_size();
        match self.object_table.entry(object_info.object_id) {
            Entry::Occupied(_) => Err((PlasmaError::ObjectExists, allocation)),
            Entry::Vacant(slot) => {
                self.num_bytes_unsealed += size;
                self.cumulative_created_bytes += size;
                Ok(slot.insert(LocalObject::new(allocation, object_info, source)))
            }
        }
    }

    pub fn get_object(&self, object_id: &ObjectID) -> Option<&LocalObject> {
        self.object_table.get(object_id)
    }

    pub fn get_object_mut(&mut self, object_id: &ObjectID) -> Option<&mut LocalObject> {
        self.object_table.get_mut(object_id)
    }

    /// Seal an object with its final contents.
    pub fn seal_object(
        &mut self,
        object_id: &ObjectID,
        buffer: Bytes,
    ) -> Result<&LocalObject, PlasmaError> {
        let obj = self
            .object_table
            .get_mut(object_id)
            .ok_or(PlasmaError::ObjectNonexistent)?;

        if obj.is_sealed() {
            return Err(PlasmaError::ObjectSealed);
        }
        let size = obj.object_size();
        if buffer.len() as u64 != size {
            return Err(PlasmaError::SizeMismatch {
                expected: size,
                actual: buffer.len() as u64,
            });
        }

        obj.seal(buffer);
        self.num_bytes_unsealed -= size;
        self.num_bytes_sealed += size;
        Ok(obj)
    }

    /// Remove an unpinned object. Returns its allocation for freeing.
    pub fn delete_object(&mut self, object_id: &ObjectID) -> Result<Allocation, PlasmaError> {
        match self.object_table.get(object_id) {
            None => return Err(PlasmaError::ObjectNonexistent),
            Some(obj) if obj.ref_count() > 0 => return Err(PlasmaError::ObjectInUse),
            Some(_) => {}
        }

        let obj = self
            .object_table
            .remove(object_id)
            .ok_or(PlasmaError::ObjectNonexistent)?;
        let size = obj.object_size();
        if obj.is_sealed() {
            self.num_bytes_sealed -= size;
        } else {
            self.num_bytes_unsealed -= size;
        }
        Ok(obj.allocation)
    }

    pub fn contains(&self, object_id: &ObjectID) -> bool {
        self.object_table.contains_key(object_id)
    }

    pub fn num_objects(&self) -> usize {
        self.object_table.len()
    }

    pub fn num_bytes_sealed(&self) -> u64 {
        self.num_bytes_sealed
    }

    pub fn num_bytes_unsealed(&self) -> u64 {
        self.num_bytes_unsealed
    }

    pub fn num_bytes_in_use(&self) -> u64 {
        self.num_bytes_sealed + self.num_bytes_unsealed
    }

    pub fn cumulative_created_bytes(&self) -> u64 {
        self.cumulative_created_bytes
    }
}
