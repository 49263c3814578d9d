// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Per-node shared object store and cross-node object transfer.
//!
//! - [`plasma`]: the node's shared region. Objects are written once by a
//!   single writer, sealed, then read by any number of workers as
//!   zero-copy views.
//! - [`pull_manager`]: fetches sealed objects from other nodes in chunks,
//!   with bounded retries, and caches them in the local region.
//! - [`object_manager`]: the per-node facade combining both.
//! - [`transport`]: how nodes reach each other.

pub mod common;
pub mod object_manager;
pub mod plasma;
pub mod pull_manager;
pub mod transport;
