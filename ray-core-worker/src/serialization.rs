// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Serialized object representation and the MessagePack codec.
//!
//! A value is serialized exactly once, at `put` or task return; the
//! resulting bytes travel unchanged through the local store, the shared
//! store and cross-node pulls. The metadata tag records how to read them.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use ray_common::constants::{
    OBJECT_METADATA_MSGPACK, OBJECT_METADATA_RAW, OBJECT_METADATA_TASK_ERROR,
};

use crate::error::{CoreWorkerError, CoreWorkerResult};

/// A serialized Ray object: payload bytes plus an encoding tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RayObject {
    pub data: Bytes,
    pub metadata: Bytes,
}

impl RayObject {
    pub fn new(data: Bytes, metadata: Bytes) -> Self {
        Self { data, metadata }
    }

    /// An opaque byte payload that bypasses the codec.
    pub fn from_raw(data: impl Into<Bytes>) -> Self {
        Self::new(data.into(), Bytes::from_static(OBJECT_METADATA_RAW))
    }

    /// An error record standing in for the return value of a failed task.
    pub fn task_error(message: &str) -> Self {
        Self::new(
            Bytes::copy_from_slice(message.as_bytes()),
            Bytes::from_static(OBJECT_METADATA_TASK_ERROR),
        )
    }

    /// Total serialized size, the quantity compared against the promotion
    /// threshold.
    pub fn size(&self) -> u64 {
        (self.data.len() + self.metadata.len()) as u64
    }

    pub fn is_raw(&self) -> bool {
        self.metadata.as_ref() == OBJECT_METADATA_RAW
    }

    pub fn is_task_error(&self) -> bool {
        self.metadata.as_ref() == OBJECT_METADATA_TASK_ERROR
    }

    /// The failure carried by an error record, as the caller sees it.
    pub fn to_error(&self) -> Option<CoreWorkerError> {
        self.is_task_error()
            .then(|| CoreWorkerError::task_failed(String::from_utf8_lossy(&self.data)))
    }
}

/// Encode a value with MessagePack.
pub fn serialize<T: Serialize + ?Sized>(value: &T) -> CoreWorkerResult<RayObject> {
    let data = rmp_serde::to_vec(value)?;
    Ok(RayObject::new(
        Bytes::from(data),
        Bytes::from_static(OBJECT_METADATA_MSGPACK),
    ))
}

/// Decode a value previously produced by [`serialize`].
///
/// Error records decode to the task failure they carry.
pub fn deserialize<T: DeserializeOwned>(object: &RayObject) -> CoreWorkerResult<T> {
    if let Some(err) = object.to_error() {
        return Err(err);
    }
    if object.metadata.as_ref() != OBJECT_METADATA_MSGPACK {
        return Err(CoreWorkerError::Serialization(format!(
            "cannot decode object tagged {:?}",
            String::from_utf8_lossy(&object.metadata)
        )));
    }
    Ok(rmp_serde::from_slice(&object.data)?)
}
