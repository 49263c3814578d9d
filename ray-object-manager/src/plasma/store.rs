// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Plasma store: the node's shared object region.
//!
//! Lifecycle of an object: CREATE → write → SEAL → GET/pin/unpin → DELETE.
//!
//! `create_object` hands out the only [`ObjectWriter`] for an ID. Sealing
//! consumes the writer and freezes its buffer, so after the seal nobody can
//! mutate the bytes and readers share them without locking or copying.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use ray_common::id::ObjectID;

use crate::common::{ObjectInfo, ObjectSource, PlasmaError};
use crate::plasma::allocator::IAllocator;
use crate::plasma::object_store::ObjectStore;

/// Exclusive write access to a created, unsealed object.
#[derive(Debug)]
pub struct ObjectWriter {
    info: ObjectInfo,
    buffer: BytesMut,
}

impl ObjectWriter {
    pub fn object_id(&self) -> ObjectID {
        self.info.object_id
    }

    pub fn info(&self) -> &ObjectInfo {
        &self.info
    }

    /// The data section.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let data_size = self.info.data_size as usize;
        &mut self.buffer[..data_size]
    }

    /// The metadata section.
    pub fn metadata_mut(&mut self) -> &mut [u8] {
        let data_size = self.info.data_size as usize;
        &mut self.buffer[data_size..]
    }

    /// Copy `chunk` into the object at `offset` (data and metadata are one
    /// contiguous range).
    pub fn write_at(&mut self, offset: u64, chunk: &[u8]) -> Result<(), PlasmaError> {
        let start = offset as usize;
        let end = start
            .checked_add(chunk.len())
            .filter(|end| *end <= self.buffer.len())
            .ok_or(PlasmaError::SizeMismatch {
                expected: self.info.get_object_size(),
                actual: offset + chunk.len() as u64,
            })?;
        self.buffer[start..end].copy_from_slice(chunk);
        Ok(())
    }
}

/// A zero-copy view of a sealed object.
///
/// Cloning the view or slicing its fields never copies payload bytes.
#[derive(Debug, Clone)]
pub struct PlasmaObjectView {
    pub info: ObjectInfo,
    pub data: Bytes,
    pub metadata: Bytes,
}

impl PlasmaObjectView {
    fn from_sealed(info: ObjectInfo, buffer: &Bytes) -> Self {
        let data_size = info.data_size as usize;
        Self {
            data: buffer.slice(..data_size),
            metadata: buffer.slice(data_size..),
            info,
        }
    }

    pub fn object_id(&self) -> ObjectID {
        self.info.object_id
    }

    /// Contiguous `[offset, offset + len)` of data followed by metadata.
    pub fn read_range(&self, offset: u64, len: u64) -> Bytes {
        let data_len = self.data.len() as u64;
        let total = data_len + self.metadata.len() as u64;
        let start = offset.min(total);
        let end = offset.saturating_add(len).min(total);
        if end <= data_len {
            self.data.slice(start as usize..end as usize)
        } else if start >= data_len {
            self.metadata
                .slice((start - data_len) as usize..(end - data_len) as usize)
        } else {
            let mut joined = BytesMut::with_capacity((end - start) as usize);
            joined.extend_from_slice(&self.data[start as usize..]);
            joined.extend_from_slice(&self.metadata[..(end - data_len) as usize]);
            joined.freeze()
        }
    }
}

/// The plasma store.
///
/// Thread safety: all table state sits behind one mutex; payload reads
/// happen outside it on frozen buffers.
pub struct PlasmaStore {
    allocator: Arc<dyn IAllocator>,
    inner: Mutex<ObjectStore>,
}

impl PlasmaStore {
    pub fn new(allocator: Arc<dyn IAllocator>) -> Self {
        Self {
            allocator,
            inner: Mutex::new(ObjectStore::new()),
        }
    }

    /// Allocate an object. The returned writer is the only way to fill it.
    ///
    /// There is no eviction: a full region fails with `OutOfMemory`.
    pub fn create_object(
        &self,
        object_info: ObjectInfo,
        source: ObjectSource,
    ) -> Result<ObjectWriter, PlasmaError> {
        let size = object_info.get_object_size();
        let mut inner = self.inner.lock();
        if inner.contains(&object_info.object_id) {
            return Err(PlasmaError::ObjectExists);
        }
        let (allocation, buffer) =
            self.allocator
                .allocate(size)
                .ok_or(PlasmaError::OutOfMemory {
                    requested: size,
                    available: self.allocator.available(),
                })?;

        if let Err((err, allocation)) =
            inner.create_object(allocation, object_info.clone(), source)
        {
            self.allocator.free(allocation);
            return Err(err);
        }
        tracing::trace!(object_id = %object_info.object_id, size, ?source, "Created plasma object");
        Ok(ObjectWriter {
            info: object_info,
            buffer,
        })
    }

    /// Seal a written object, making it immutable and readable.
    pub fn seal_object(&self, writer: ObjectWriter) -> Result<PlasmaObjectView, PlasmaError> {
        let ObjectWriter { info, buffer } = writer;
        let frozen = buffer.freeze();
        let mut inner = self.inner.lock();
        let obj = inner.seal_object(&info.object_id, frozen.clone())?;
        tracing::trace!(object_id = %info.object_id, "Sealed plasma object");
        Ok(PlasmaObjectView::from_sealed(obj.object_info().clone(), &frozen))
    }

    /// Create, fill and seal in one step.
    pub fn create_and_seal(
        &self,
        object_info: ObjectInfo,
        source: ObjectSource,
        data: &[u8],
        metadata: &[u8],
    ) -> Result<PlasmaObjectView, PlasmaError> {
        if object_info.data_size != data.len() as u64
            || object_info.metadata_size != metadata.len() as u64
        {
            return Err(PlasmaError::SizeMismatch {
                expected: object_info.get_object_size(),
                actual: (data.len() + metadata.len()) as u64,
            });
        }
        let mut writer = self.create_object(object_info, source)?;
        writer.data_mut().copy_from_slice(data);
        writer.metadata_mut().copy_from_slice(metadata);
        self.seal_object(writer)
    }

    /// Drop an unsealed object after a failed write.
    pub fn abort_object(&self, writer: ObjectWriter) -> Result<(), PlasmaError> {
        let object_id = writer.object_id();
        let allocation = {
            let mut inner = self.inner.lock();
            match inner.get_object(&object_id).map(|obj| obj.is_sealed()) {
                Some(true) => return Err(PlasmaError::ObjectSealed),
                Some(false) => inner.delete_object(&object_id)?,
                None => return Err(PlasmaError::ObjectNonexistent),
            }
        };
        self.allocator.free(allocation);
        Ok(())
    }

    /// View of a sealed object, or `None` if absent or still being written.
    pub fn get(&self, object_id: &ObjectID) -> Option<PlasmaObjectView> {
        let inner = self.inner.lock();
        let obj = inner.get_object(object_id)?;
        let buffer = obj.buffer()?;
        Some(PlasmaObjectView::from_sealed(obj.object_info().clone(), buffer))
    }

    pub fn get_object_info(&self, object_id: &ObjectID) -> Option<ObjectInfo> {
        let inner = self.inner.lock();
        inner
            .get_object(object_id)
            .filter(|obj| obj.is_sealed())
            .map(|obj| obj.object_info().clone())
    }

    /// Pin an object against deletion.
    pub fn begin_object_access(&self, object_id: &ObjectID) -> Result<(), PlasmaError> {
        let mut inner = self.inner.lock();
        let obj = inner
            .get_object_mut(object_id)
            .ok_or(PlasmaError::ObjectNonexistent)?;
        if !obj.is_sealed() {
            return Err(PlasmaError::ObjectNotSealed);
        }
        obj.incr_ref();
        Ok(())
    }

    pub fn end_object_access(&self, object_id: &ObjectID) -> Result<(), PlasmaError> {
        let mut inner = self.inner.lock();
        let obj = inner
            .get_object_mut(object_id)
            .ok_or(PlasmaError::ObjectNonexistent)?;
        if obj.decr_ref() {
            Ok(())
        } else {
            Err(PlasmaError::ObjectNotSealed)
        }
    }

    /// Delete an object and release its capacity. Views already handed out
    /// stay valid until dropped.
    pub fn delete_object(&self, object_id: &ObjectID) -> Result<(), PlasmaError> {
        let allocation = self.inner.lock().delete_object(object_id)?;
        self.allocator.free(allocation);
        tracing::trace!(object_id = %object_id, "Deleted plasma object");
        Ok(())
    }

    pub fn contains(&self, object_id: &ObjectID) -> bool {
        self.inner.lock().contains(object_id)
    }

    pub fn num_objects(&self) -> usize {
        self.inner.lock().num_objects()
    }

    pub fn num_bytes_in_use(&self) -> u64 {
        self.inner.lock().num_bytes_in_use()
    }

    pub fn capacity(&self) -> u64 {
        self.allocator.footprint_limit()
    }

    pub fn available(&self) -> u64 {
        self.allocator.available()
    }
}
