// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Shared test helpers for the Ray object store crates.

pub mod generators;
pub mod wait;

pub use generators::{random_node_id, random_object_id, random_worker_id};
pub use wait::{measure, wait_for_condition};

/// Initialize tracing for tests. Safe to call from every test.
pub fn init_test_logging() {
    let filter = std::env::var("RAY_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(filter)
        .try_init();
}

/// Create a temporary directory for test data.
pub fn test_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}
