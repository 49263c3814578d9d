// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Ray ID types.
//!
//! ID layout:
//! - `WorkerID` (16 random bytes)
//! - `NodeID` (16 random bytes)
//! - `ObjectID` (24 bytes = 16 creator WorkerID + 8 big-endian put counter)
//!
//! IDs cross process and node boundaries as opaque byte strings; equality
//! is byte equality.

use std::fmt;
use std::hash::{Hash, Hasher};

use rand::Rng;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::{OBJECT_ID_INDEX_SIZE, UNIQUE_ID_SIZE};
use crate::status::{RayError, RayResult};

// ─── MurmurHash64A ──────────────────────────────────────────────────────────

fn murmur_hash_64a(key: &[u8], seed: u64) -> u64 {
    const M: u64 = 0xc6a4a7935bd1e995;
    const R: i32 = 47;

    let len = key.len();
    let mut h: u64 = seed ^ ((len as u64).wrapping_mul(M));

    let mut chunks = key.chunks_exact(8);
    for chunk in &mut chunks {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(chunk);
        let mut k = u64::from_le_bytes(buf);

        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);

        h ^= k;
        h = h.wrapping_mul(M);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        for (i, byte) in tail.iter().enumerate().rev() {
            h ^= (*byte as u64) << (8 * i);
        }
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;

    h
}

// ─── ID Macro ────────────────────────────────────────────────────────────────

/// Generates a fixed-size ID type.
///
/// Each ID is a `[u8; N]` newtype with:
/// - `try_from_binary` / `from_hex` / `from_random` constructors
/// - `binary()` / `hex()` / `data()` accessors
/// - `Hash` (MurmurHash64A), `Eq`, `Ord`, `Copy`, `Debug`, `Display`
/// - `Nil` default (all 0xFF bytes)
/// - serde as a byte string
macro_rules! define_ray_id {
    ($name:ident, $size:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
        #[repr(C)]
        pub struct $name {
            data: [u8; $size],
        }

        impl $name {
            /// The fixed byte size of this ID type.
            pub const SIZE: usize = $size;

            pub const fn nil() -> Self {
                Self {
                    data: [0xFF; $size],
                }
            }

            pub const fn from_array(data: [u8; $size]) -> Self {
                Self { data }
            }

            /// Create an ID from wire bytes.
            pub fn try_from_binary(bytes: &[u8]) -> RayResult<Self> {
                let data: [u8; $size] = bytes.try_into().map_err(|_| {
                    RayError::invalid_argument(format!(
                        "expected {} bytes for {}, got {}",
                        $size,
                        stringify!($name),
                        bytes.len()
                    ))
                })?;
                Ok(Self { data })
            }

            pub fn from_hex(hex_str: &str) -> RayResult<Self> {
                let bytes = hex::decode(hex_str).map_err(|e| {
                    RayError::invalid_argument(format!(
                        "invalid hex string for {}: {e}",
                        stringify!($name)
                    ))
                })?;
                Self::try_from_binary(&bytes)
            }

            pub fn from_random() -> Self {
                let mut data = [0u8; $size];
                rand::thread_rng().fill(&mut data[..]);
                Self { data }
            }

            pub fn is_nil(&self) -> bool {
                self.data == [0xFF; $size]
            }

            pub fn data(&self) -> &[u8; $size] {
                &self.data
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.data
            }

            /// Owned copy of the wire bytes.
            pub fn binary(&self) -> Vec<u8> {
                self.data.to_vec()
            }

            pub fn hex(&self) -> String {
                hex::encode(self.data)
            }

            pub fn murmur_hash(&self) -> u64 {
                murmur_hash_64a(&self.data, 0)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::nil()
            }
        }

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.murmur_hash().hash(state);
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.hex())
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.data
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_bytes(&self.data)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                struct IdVisitor;

                impl<'de> Visitor<'de> for IdVisitor {
                    type Value = $name;

                    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        write!(f, "{} bytes for {}", $size, stringify!($name))
                    }

                    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<$name, E> {
                        $name::try_from_binary(v).map_err(E::custom)
                    }

                    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<$name, A::Error> {
                        let mut data = [0u8; $size];
                        for (i, slot) in data.iter_mut().enumerate() {
                            *slot = seq
                                .next_element()?
                                .ok_or_else(|| <A::Error as de::Error>::invalid_length(i, &self))?;
                        }
                        Ok($name { data })
                    }
                }

                deserializer.deserialize_bytes(IdVisitor)
            }
        }
    };
}

// ─── ID Type Definitions ────────────────────────────────────────────────────

define_ray_id!(WorkerID, UNIQUE_ID_SIZE);
define_ray_id!(NodeID, UNIQUE_ID_SIZE);
define_ray_id!(ObjectID, UNIQUE_ID_SIZE + OBJECT_ID_INDEX_SIZE);

// ─── ObjectID extras ────────────────────────────────────────────────────────

impl ObjectID {
    /// Build the ID of the `index`-th object created by `creator`.
    ///
    /// Indices start at 1 and are never reused by a creator, so the pair is
    /// globally unique as long as worker IDs are.
    pub fn from_index(creator: &WorkerID, index: u64) -> Self {
        let mut data = [0u8; UNIQUE_ID_SIZE + OBJECT_ID_INDEX_SIZE];
        data[..UNIQUE_ID_SIZE].copy_from_slice(creator.data());
        data[UNIQUE_ID_SIZE..].copy_from_slice(&index.to_be_bytes());
        Self { data }
    }

    /// The worker that generated this ID.
    pub fn creator_id(&self) -> WorkerID {
        let mut data = [0u8; UNIQUE_ID_SIZE];
        data.copy_from_slice(&self.data[..UNIQUE_ID_SIZE]);
        WorkerID::from_array(data)
    }

    /// The creator's put counter value.
    pub fn index(&self) -> u64 {
        let mut buf = [0u8; OBJECT_ID_INDEX_SIZE];
        buf.copy_from_slice(&self.data[UNIQUE_ID_SIZE..]);
        u64::from_be_bytes(buf)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
