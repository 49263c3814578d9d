// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Random IDs and payloads for tests.

use rand::Rng;
use ray_common::id::{NodeID, ObjectID, WorkerID};

pub fn random_node_id() -> NodeID {
    NodeID::from_random()
}

pub fn random_worker_id() -> WorkerID {
    WorkerID::from_random()
}

/// An ObjectID from a random creator with a random non-zero index.
pub fn random_object_id() -> ObjectID {
    let index = rand::thread_rng().gen_range(1..=u32::MAX as u64);
    ObjectID::from_index(&random_worker_id(), index)
}

/// `len` pseudo-random bytes.
pub fn random_payload(len: usize) -> Vec<u8> {
    let mut payload = vec![0u8; len];
    rand::thread_rng().fill(&mut payload[..]);
    payload
}
