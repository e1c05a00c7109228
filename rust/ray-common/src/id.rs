// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Ray ID types used by placement-group scheduling.
//!
//! - `JobID` (4 bytes)
//! - `PlacementGroupID` (18 bytes = 14 unique + 4 JobID)
//! - `NodeID` (28 bytes)
//! - `BundleID` = (`PlacementGroupID`, bundle index)

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::constants::UNIQUE_ID_SIZE;

// ─── MurmurHash64A ──────────────────────────────────────────────────────────
// Stable across processes so IDs hash identically everywhere.

fn murmur_hash_64a(key: &[u8], seed: u64) -> u64 {
    const M: u64 = 0xc6a4a7935bd1e995;
    const R: i32 = 47;

    let len = key.len();
    let mut h: u64 = seed ^ ((len as u64).wrapping_mul(M));

    // Process 8-byte chunks
    let n_blocks = len / 8;
    for chunk in key.chunks_exact(8) {
        let mut block = [0u8; 8];
        block.copy_from_slice(chunk);
        let mut k = u64::from_le_bytes(block);

        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);

        h ^= k;
        h = h.wrapping_mul(M);
    }

    // Process remaining bytes
    let tail = &key[n_blocks * 8..];
    let remaining = len & 7;
    if remaining >= 7 {
        h ^= (tail[6] as u64) << 48;
    }
    if remaining >= 6 {
        h ^= (tail[5] as u64) << 40;
    }
    if remaining >= 5 {
        h ^= (tail[4] as u64) << 32;
    }
    if remaining >= 4 {
        h ^= (tail[3] as u64) << 24;
    }
    if remaining >= 3 {
        h ^= (tail[2] as u64) << 16;
    }
    if remaining >= 2 {
        h ^= (tail[1] as u64) << 8;
    }
    if remaining >= 1 {
        h ^= tail[0] as u64;
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;

    h
}

// ─── ID Macro ────────────────────────────────────────────────────────────────

/// Generates a fixed-size Ray ID type.
///
/// Each ID is a `[u8; N]` newtype with:
/// - `from_binary` / `from_hex` / `from_random` constructors
/// - `binary()` / `hex()` / `data()` accessors
/// - `Hash`, `Eq`, `Ord`, `Clone`, `Copy`, `Debug`, `Display`
/// - byte-wise ordering, so node sets can be walked deterministically
/// - `Nil` default (all 0xFF bytes)
macro_rules! define_ray_id {
    ($name:ident, $size:expr) => {
        #[derive(Clone, Copy)]
        #[repr(C)]
        pub struct $name {
            data: [u8; $size],
        }

        impl $name {
            /// The fixed byte size of this ID type.
            pub const SIZE: usize = $size;

            /// Create a nil ID (all 0xFF bytes).
            pub const fn nil() -> Self {
                Self {
                    data: [0xFF; $size],
                }
            }

            /// Create an ID from raw bytes. Panics if `bytes.len() != SIZE`.
            pub fn from_binary(bytes: &[u8]) -> Self {
                assert_eq!(
                    bytes.len(),
                    $size,
                    "expected {} bytes for {}, got {}",
                    $size,
                    stringify!($name),
                    bytes.len()
                );
                let mut data = [0u8; $size];
                data.copy_from_slice(bytes);
                Self { data }
            }

            /// Create an ID from a hex string. Returns `Nil` on invalid input.
            pub fn from_hex(hex_str: &str) -> Self {
                if hex_str.len() != $size * 2 {
                    tracing::error!(
                        "incorrect hex string length for {}: expected {}, got {}",
                        stringify!($name),
                        $size * 2,
                        hex_str.len()
                    );
                    return Self::nil();
                }
                match hex::decode(hex_str) {
                    Ok(bytes) => Self::from_binary(&bytes),
                    Err(_) => {
                        tracing::error!("invalid hex string for {}", stringify!($name));
                        Self::nil()
                    }
                }
            }

            /// Create a random ID.
            pub fn from_random() -> Self {
                let mut data = [0u8; $size];
                ray_util::random::fill_random(&mut data);
                Self { data }
            }

            /// Returns true if this is the nil ID (all 0xFF).
            pub fn is_nil(&self) -> bool {
                self.data == [0xFF; $size]
            }

            /// Raw byte slice reference.
            pub fn data(&self) -> &[u8; $size] {
                &self.data
            }

            /// Raw byte slice as `&[u8]`.
            pub fn as_bytes(&self) -> &[u8] {
                &self.data
            }

            /// Binary string (owned copy of the bytes).
            pub fn binary(&self) -> Vec<u8> {
                self.data.to_vec()
            }

            /// Hex-encoded string (lowercase).
            pub fn hex(&self) -> String {
                hex::encode(self.data)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::nil()
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.data == other.data
            }
        }

        impl Eq for $name {}

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.data.cmp(&other.data)
            }
        }

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                // Hash the murmur digest so IDs hash the same on every node.
                murmur_hash_64a(&self.data, 0).hash(state);
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
    };
}

// ─── ID Type Definitions ────────────────────────────────────────────────────

// JobID: 4 bytes
define_ray_id!(JobID, 4);

// PlacementGroupID: 18 bytes (14 unique + 4 JobID)
define_ray_id!(PlacementGroupID, 18);

// NodeID: 28 bytes (kUniqueIDSize)
define_ray_id!(NodeID, UNIQUE_ID_SIZE);

// ─── JobID extras ───────────────────────────────────────────────────────────

impl JobID {
    /// Create a JobID from a u32 integer.
    pub fn from_int(value: u32) -> Self {
        Self {
            data: value.to_be_bytes(),
        }
    }

    /// Convert to a u32 integer.
    pub fn to_int(&self) -> u32 {
        u32::from_be_bytes(self.data)
    }
}

// ─── PlacementGroupID extras ────────────────────────────────────────────────

impl PlacementGroupID {
    const UNIQUE_BYTES_LENGTH: usize = 14;

    /// Create a random PlacementGroupID for a given job.
    pub fn of(job_id: &JobID) -> Self {
        let mut data = [0u8; 18];
        ray_util::random::fill_random(&mut data[..Self::UNIQUE_BYTES_LENGTH]);
        data[Self::UNIQUE_BYTES_LENGTH..].copy_from_slice(job_id.data());
        Self { data }
    }

    /// Extract the embedded JobID (last 4 bytes).
    pub fn job_id(&self) -> JobID {
        JobID::from_binary(&self.data[Self::UNIQUE_BYTES_LENGTH..])
    }
}

/// Bundle ID type: (PlacementGroupID, bundle_index).
pub type BundleID = (PlacementGroupID, i64);

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nil_id() {
        let id = JobID::nil();
        assert!(id.is_nil());
        assert_eq!(id.data(), &[0xFF; 4]);
    }

    #[test]
    fn test_job_id_from_int() {
        let job_id = JobID::from_int(42);
        assert_eq!(job_id.to_int(), 42);
        assert!(!job_id.is_nil());
    }

    #[test]
    fn test_placement_group_id_embeds_job_id() {
        let job_id = JobID::from_int(99);
        let pg_id = PlacementGroupID::of(&job_id);
        assert_eq!(pg_id.job_id(), job_id);
        assert_eq!(pg_id.hex().len(), PlacementGroupID::SIZE * 2);
    }

    #[test]
    fn test_hex_parsing() {
        let id = NodeID::from_random();
        assert_eq!(NodeID::from_hex(&id.hex()), id);
        assert!(NodeID::from_hex("abc").is_nil());
        assert!(NodeID::from_hex(&"zz".repeat(NodeID::SIZE)).is_nil());
    }

    #[test]
    fn test_node_id_ordering_is_bytewise() {
        let mut low = [0u8; UNIQUE_ID_SIZE];
        low[0] = 1;
        let mut high = [0u8; UNIQUE_ID_SIZE];
        high[0] = 2;
        let mut ids = vec![NodeID::from_binary(&high), NodeID::from_binary(&low)];
        ids.sort();
        assert_eq!(ids[0], NodeID::from_binary(&low));
    }

    #[test]
    fn test_hash_deterministic() {
        use std::collections::hash_map::DefaultHasher;
        let id = NodeID::from_random();
        let copy = NodeID::from_binary(id.as_bytes());
        let digest = |id: &NodeID| {
            let mut hasher = DefaultHasher::new();
            id.hash(&mut hasher);
            hasher.finish()
        };
        assert_eq!(digest(&id), digest(&copy));
    }
}
