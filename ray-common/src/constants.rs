// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Shared constants.

/// Length of worker and node identities in bytes.
pub const UNIQUE_ID_SIZE: usize = 16;

/// Width of the per-creator put counter embedded in an ObjectID.
pub const OBJECT_ID_INDEX_SIZE: usize = 8;

/// Serialized objects strictly below this size stay in the creating
/// process; at or above it they are promoted to the node's shared store.
pub const DEFAULT_MAX_DIRECT_CALL_OBJECT_SIZE: usize = 100 * 1024;

/// Default capacity of a node's shared store (1 GiB).
pub const DEFAULT_OBJECT_STORE_MEMORY: u64 = 1024 * 1024 * 1024;

/// Default transfer chunk for cross-node pulls (8 MiB).
pub const DEFAULT_OBJECT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Object metadata tags describing how the payload bytes are encoded.
pub const OBJECT_METADATA_RAW: &[u8] = b"RAW";
pub const OBJECT_METADATA_MSGPACK: &[u8] = b"MSGPACK";
pub const OBJECT_METADATA_TASK_ERROR: &[u8] = b"TASK_ERROR";

/// Prefix of environment variables overriding `RayConfig` fields.
pub const CONFIG_ENV_PREFIX: &str = "RAY_";
