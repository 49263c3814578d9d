// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Plasma memory allocator.
//!
//! The region is a capacity-accounted pool of reference-counted buffers.
//! An allocation hands out a writable `BytesMut`; once sealed it is frozen
//! into `Bytes`, so every reader on the node shares the same memory.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;

/// A reservation of region capacity.
///
/// Move-only. Dropping an `Allocation` does NOT release the capacity; it
/// must be returned to the allocator via [`IAllocator::free`].
#[derive(Debug)]
pub struct Allocation {
    /// Requested bytes.
    pub size: u64,
    /// Bytes charged against the footprint (size rounded up to alignment).
    pub reserved: u64,
}

pub trait IAllocator: Send + Sync {
    /// Reserve `bytes` and return a zeroed buffer of exactly that length,
    /// or `None` when the footprint limit would be exceeded.
    fn allocate(&self, bytes: u64) -> Option<(Allocation, BytesMut)>;

    fn free(&self, allocation: Allocation);

    fn footprint_limit(&self) -> u64;

    fn allocated(&self) -> u64;

    fn available(&self) -> u64 {
        self.footprint_limit().saturating_sub(self.allocated())
    }
}

/// Default allocator: heap buffers with cache-line aligned accounting.
pub struct PlasmaAllocator {
    footprint_limit: u64,
    alignment: u64,
    allocated: AtomicU64,
}

impl PlasmaAllocator {
    pub fn new(footprint_limit: u64) -> Self {
        Self {
            footprint_limit,
            alignment: 64,
            allocated: AtomicU64::new(0),
        }
    }

    fn align_up(&self, size: u64) -> u64 {
        (size + self.alignment - 1) & !(self.alignment - 1)
    }
}

impl IAllocator for PlasmaAllocator {
    fn allocate(&self, bytes: u64) -> Option<(Allocation, BytesMut)> {
        let reserved = self.align_up(bytes.max(1));
        let limit = self.footprint_limit;
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(reserved).filter(|next| *next <= limit)
            })
            .ok()?;
        let buffer = BytesMut::zeroed(bytes as usize);
        Some((
            Allocation {
                size: bytes,
                reserved,
            },
            buffer,
        ))
    }

    fn free(&self, allocation: Allocation) {
        self.allocated
            .fetch_sub(allocation.reserved, Ordering::AcqRel);
    }

    fn footprint_limit(&self) -> u64 {
        self.footprint_limit
    }

    fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }
}
