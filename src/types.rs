//! On-disk record types and mode tags.
//!
//! # File layout (little-endian)
//! ```text
//! [0..512)            StoreHeader
//! [512 + i·512 ..)    Slot i — 512 bytes, 64-byte aligned
//! [mphf_offset ..)    serialized MPHF payload + crc32 trailer (appended by optimize)
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64};

/// "MAPH" in the header's first four bytes.
pub const STORE_MAGIC: u32 = 0x4D41_5048;
pub const FORMAT_VERSION: u32 = 2;

pub const HEADER_SIZE: usize = 512;
pub const SLOT_SIZE: usize = 512;
/// Slot bytes available for the value payload.
pub const SLOT_DATA_SIZE: usize = 496;

/// One 512-byte slot.
///
/// `hash_version` packs a 32-bit key hash (high half, 0 ⇒ empty) with a
/// 32-bit version counter (low half). Even version = committed, odd =
/// write in progress. Readers must not touch `data` when the hash is 0:
/// cleared slots keep their stale bytes.
#[repr(C, align(64))]
pub struct Slot {
    pub hash_version: AtomicU64,
    pub size: AtomicU32,
    pub _reserved: u32,
    pub data: [u8; SLOT_DATA_SIZE],
}

const _: () = assert!(std::mem::size_of::<Slot>() == SLOT_SIZE);

#[inline]
pub fn pack_hash_version(hash: u32, version: u32) -> u64 {
    ((hash as u64) << 32) | version as u64
}

#[inline]
pub fn split_hash_version(hv: u64) -> (u32, u32) {
    ((hv >> 32) as u32, hv as u32)
}

/// File header at offset 0. Mutable fields are atomics so the single
/// writer can publish mode/generation changes to concurrent readers
/// through the shared mapping.
#[repr(C)]
pub struct StoreHeader {
    pub magic: u32,
    pub format_version: u32,
    pub total_slots: u64,
    /// Bumped with release ordering by every successful mutation.
    pub generation: AtomicU64,
    pub mode: AtomicU32,
    pub algorithm: AtomicU32,
    pub mphf_offset: AtomicU64,
    pub mphf_size: AtomicU64,
    pub _reserved: [u8; 464],
}

const _: () = assert!(std::mem::size_of::<StoreHeader>() == HEADER_SIZE);

/// Lookup dispatch mode, persisted in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HashMode {
    /// FNV-1a + bounded linear probing.
    Standard,
    /// Minimal perfect hash over the optimized key set; misses are definitive.
    Perfect,
    /// MPHF for the optimized set, probing for keys inserted since.
    Hybrid,
}

impl HashMode {
    pub fn as_u32(self) -> u32 {
        match self {
            HashMode::Standard => 0,
            HashMode::Perfect => 1,
            HashMode::Hybrid => 2,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(HashMode::Standard),
            1 => Some(HashMode::Perfect),
            2 => Some(HashMode::Hybrid),
            _ => None,
        }
    }
}

/// MPHF construction family, persisted in the header and in every
/// serialized payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MphfKind {
    None,
    RecSplit,
    Chd,
    BbHash,
    PtHash,
    Fch,
}

impl MphfKind {
    pub fn as_u32(self) -> u32 {
        match self {
            MphfKind::None => 0,
            MphfKind::RecSplit => 1,
            MphfKind::Chd => 2,
            MphfKind::BbHash => 3,
            MphfKind::PtHash => 4,
            MphfKind::Fch => 5,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(MphfKind::None),
            1 => Some(MphfKind::RecSplit),
            2 => Some(MphfKind::Chd),
            3 => Some(MphfKind::BbHash),
            4 => Some(MphfKind::PtHash),
            5 => Some(MphfKind::Fch),
            _ => None,
        }
    }

    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" | "standard" => Some(MphfKind::None),
            "recsplit" => Some(MphfKind::RecSplit),
            "chd" => Some(MphfKind::Chd),
            "bbhash" => Some(MphfKind::BbHash),
            "pthash" => Some(MphfKind::PtHash),
            "fch" => Some(MphfKind::Fch),
            _ => None,
        }
    }
}

/// Snapshot returned by `KilatDB::stats()`. `used_slots` is an O(N) scan.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub total_slots: u64,
    pub used_slots: u64,
    pub load_factor: f64,
    pub generation: u64,
    pub mode: HashMode,
    pub algorithm: MphfKind,
    pub perfect_hash_memory: usize,
}
