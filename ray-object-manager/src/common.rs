// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Common types for the object manager.

use std::time::Duration;

use ray_common::config::RayConfig;
use ray_common::id::{NodeID, ObjectID, WorkerID};
use ray_common::status::{RayError, StatusCode};

/// Information about an object stored in a node's shared region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub object_id: ObjectID,
    pub data_size: u64,
    pub metadata_size: u64,
    pub owner_node_id: NodeID,
    pub owner_worker_id: WorkerID,
}

impl ObjectInfo {
    pub fn new(object_id: ObjectID, data_size: u64, metadata_size: u64) -> Self {
        Self {
            object_id,
            data_size,
            metadata_size,
            owner_node_id: NodeID::nil(),
            owner_worker_id: object_id.creator_id(),
        }
    }

    pub fn with_owner(mut self, node_id: NodeID, worker_id: WorkerID) -> Self {
        self.owner_node_id = node_id;
        self.owner_worker_id = worker_id;
        self
    }

    /// Total object size: data followed by metadata.
    pub fn get_object_size(&self) -> u64 {
        self.data_size + self.metadata_size
    }
}

impl Default for ObjectInfo {
    fn default() -> Self {
        Self {
            object_id: ObjectID::nil(),
            data_size: 0,
            metadata_size: 0,
            owner_node_id: NodeID::nil(),
            owner_worker_id: WorkerID::nil(),
        }
    }
}

/// How an object came to be in the local region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectSource {
    /// Promoted by a worker on this node (`put` or a task return).
    CreatedByWorker,
    /// Copied from another node by the pull manager.
    ReceivedFromRemoteNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PlasmaError {
    #[error("object already exists")]
    ObjectExists,
    #[error("object does not exist")]
    ObjectNonexistent,
    #[error("out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: u64, available: u64 },
    #[error("object not sealed")]
    ObjectNotSealed,
    #[error("object in use")]
    ObjectInUse,
    #[error("object already sealed")]
    ObjectSealed,
    #[error("wrote {actual} bytes into an object of {expected} bytes")]
    SizeMismatch { expected: u64, actual: u64 },
}

impl From<PlasmaError> for RayError {
    fn from(err: PlasmaError) -> Self {
        let code = match err {
            PlasmaError::ObjectExists => StatusCode::ObjectExists,
            PlasmaError::ObjectNonexistent => StatusCode::ObjectNotFound,
            PlasmaError::OutOfMemory { .. } => StatusCode::ObjectStoreFull,
            PlasmaError::ObjectSealed => StatusCode::ObjectAlreadySealed,
            PlasmaError::ObjectNotSealed
            | PlasmaError::ObjectInUse
            | PlasmaError::SizeMismatch { .. } => StatusCode::Invalid,
        };
        RayError::new(code, err.to_string())
    }
}

/// Per-node object manager configuration, derived from [`RayConfig`].
#[derive(Debug, Clone)]
pub struct ObjectManagerConfig {
    pub object_store_memory: u64,
    pub object_chunk_size: u64,
    pub fetch_max_attempts: u32,
    pub fetch_retry_initial_delay: Duration,
    pub fetch_retry_max_delay: Duration,
}

impl Default for ObjectManagerConfig {
    fn default() -> Self {
        Self::from(&RayConfig::default())
    }
}

impl From<&RayConfig> for ObjectManagerConfig {
    fn from(config: &RayConfig) -> Self {
        Self {
            object_store_memory: config.object_store_memory,
            object_chunk_size: config.object_chunk_size.max(1),
            fetch_max_attempts: config.object_fetch_max_attempts,
            fetch_retry_initial_delay: config.fetch_retry_initial_delay(),
            fetch_retry_max_delay: config.fetch_retry_max_delay(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_info_size() {
        let info = ObjectInfo {
            data_size: 1024,
            metadata_size: 64,
            ..Default::default()
        };
        assert_eq!(info.get_object_size(), 1088);
    }

    #[test]
    fn test_default_owner_is_creator() {
        let worker = WorkerID::from_random();
        let info = ObjectInfo::new(ObjectID::from_index(&worker, 1), 10, 0);
        assert_eq!(info.owner_worker_id, worker);
    }

    #[test]
    fn test_config_from_ray_config() {
        let ray_config = RayConfig {
            object_chunk_size: 0,
            object_fetch_max_attempts: 7,
            ..Default::default()
        };
        let config = ObjectManagerConfig::from(&ray_config);
        assert_eq!(config.object_chunk_size, 1);
        assert_eq!(config.fetch_max_attempts, 7);
        assert_eq!(ObjectManagerConfig::default().object_chunk_size, 8 * 1024 * 1024);
    }

    #[test]
    fn test_plasma_error_status_codes() {
        let err: RayError = PlasmaError::OutOfMemory {
            requested: 10,
            available: 1,
        }
        .into();
        assert_eq!(err.code, StatusCode::ObjectStoreFull);
        let err: RayError = PlasmaError::ObjectNonexistent.into();
        assert_eq!(err.code, StatusCode::ObjectNotFound);
    }
}
