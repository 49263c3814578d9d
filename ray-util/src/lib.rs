// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Utility library for the Ray object store.
//!
//! Provides logging setup, retry backoff for object transfers and timing
//! helpers used by the store and scheduler crates.

pub mod backoff;
pub mod logging;
pub mod time;
