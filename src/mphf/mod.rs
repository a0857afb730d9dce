//! Minimal perfect hash family.
//!
//! Five interchangeable constructions (RecSplit, CHD, BBHash, PTHash,
//! FCH) share one contract: build over a key set, map every input key to
//! a unique index in `[0, key_count)`, verify membership at query time
//! with a 64-bit fingerprint instead of stored keys, and spill keys the
//! algorithm cannot place into a linearly-scanned overflow table.
//!
//! # Query procedure (all variants)
//! 1. `fp = fingerprint(key)`
//! 2. algorithm-specific candidate slot `s`
//! 3. `s < perfect_count && fingerprints[s] == fp` → `s`
//! 4. otherwise scan `(overflow_fp, overflow_slot)` for `fp`
//! 5. otherwise none

pub mod bbhash;
pub mod chd;
pub mod fch;
pub mod pthash;
pub mod rank;
pub mod recsplit;
pub(crate) mod wire;

pub use bbhash::{BbHashBuilder, BbHashMphf};
pub use chd::{ChdBuilder, ChdMphf};
pub use fch::{FchBuilder, FchMphf};
pub use pthash::{PtHashBuilder, PtHashMphf};
pub use recsplit::{RecSplitBuilder, RecSplitMphf};

use crate::error::{KilatError, Result};
use crate::types::MphfKind;
use serde::Serialize;
use wire::{WireReader, WireWriter};

pub(crate) const C1: u64 = 0x9e37_79b9_7f4a_7c15;
pub(crate) const C2: u64 = 0xbf58_476d_1ce4_e5b9;
pub(crate) const DEFAULT_SEED: u64 = 0xC0FF_EE00_D15E_A5E5;

/// Sentinel in per-bucket parameter vectors for "bucket spilled".
pub(crate) const SPILLED: u32 = u32::MAX;
/// Sentinel in sparse→dense position tables for "slot unused".
pub(crate) const NO_SLOT: u32 = u32::MAX;

/// Seeded placement hash. Distinct from both the slot hash (FNV-1a 32)
/// and the fingerprint; deterministic for a fixed seed on every platform.
#[inline]
pub(crate) fn place_hash(key: &[u8], seed: u64) -> u64 {
    seahash::hash_seeded(key, seed, seed ^ C1, seed.rotate_left(32), C2)
}

/// SplitMix-style avalanche.
#[inline]
pub(crate) fn mix64(mut z: u64) -> u64 {
    z ^= z >> 30;
    z = z.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z ^= z >> 27;
    z = z.wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^= z >> 31;
    z
}

/// 64-bit membership fingerprint: FNV-64 folded through the avalanche.
/// Never zero.
#[inline]
pub fn fingerprint(key: &[u8]) -> u64 {
    const FNV64_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV64_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut h = FNV64_OFFSET;
    for &b in key {
        h ^= b as u64;
        h = h.wrapping_mul(FNV64_PRIME);
    }
    let h = mix64(h);
    if h == 0 { 1 } else { h }
}

/// Step 1 of every build: sort and deduplicate the input keys.
pub(crate) fn sorted_dedup(mut keys: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    keys.sort_unstable();
    keys.dedup();
    keys
}

// ── overflow table ───────────────────────────────────────────────────────────

/// Parallel `(fingerprint, slot)` arrays for keys the placement failed
/// on. Expected tiny, so lookups are a linear scan — 4-lane wide compares
/// when compiled with AVX2, scalar otherwise.
#[derive(Debug, Clone, Default)]
pub struct OverflowTable {
    fps: Vec<u64>,
    slots: Vec<u32>,
}

impl OverflowTable {
    pub(crate) fn push(&mut self, fp: u64, slot: u32) {
        self.fps.push(fp);
        self.slots.push(slot);
    }

    pub fn len(&self) -> usize {
        self.fps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fps.is_empty()
    }

    #[inline]
    pub fn find(&self, fp: u64) -> Option<u32> {
        find_fp(&self.fps, fp).map(|i| self.slots[i])
    }

    pub(crate) fn memory_bytes(&self) -> usize {
        self.fps.len() * 8 + self.slots.len() * 4
    }

    pub(crate) fn write(&self, w: &mut WireWriter) {
        w.put_u64_slice(&self.fps);
        w.put_u32_slice(&self.slots);
    }

    pub(crate) fn read(r: &mut WireReader<'_>) -> Result<Self> {
        let fps = r.get_u64_vec()?;
        let slots = r.get_u32_vec()?;
        if fps.len() != slots.len() {
            return Err(KilatError::InvalidFormat("overflow arrays not parallel"));
        }
        Ok(Self { fps, slots })
    }
}

#[cfg(all(target_arch = "x86_64", target_feature = "avx2"))]
#[inline]
fn find_fp(fps: &[u64], fp: u64) -> Option<usize> {
    use std::arch::x86_64::*;
    unsafe {
        let needle = _mm256_set1_epi64x(fp as i64);
        let chunks = fps.len() / 4;
        for c in 0..chunks {
            let v = _mm256_loadu_si256(fps.as_ptr().add(c * 4) as *const __m256i);
            let eq = _mm256_cmpeq_epi64(v, needle);
            let mask = _mm256_movemask_pd(_mm256_castsi256_pd(eq));
            if mask != 0 {
                return Some(c * 4 + mask.trailing_zeros() as usize);
            }
        }
        (chunks * 4..fps.len()).find(|&i| fps[i] == fp)
    }
}

#[cfg(not(all(target_arch = "x86_64", target_feature = "avx2")))]
#[inline]
fn find_fp(fps: &[u64], fp: u64) -> Option<usize> {
    fps.iter().position(|&f| f == fp)
}

// ── fingerprint table ────────────────────────────────────────────────────────

/// The verification layer every variant carries: a fingerprint per placed
/// slot plus the overflow table. `key_count = perfect_count + overflow`.
#[derive(Debug, Clone)]
pub(crate) struct FingerprintTable {
    pub fingerprints: Vec<u64>,
    pub overflow: OverflowTable,
}

impl FingerprintTable {
    pub fn key_count(&self) -> u64 {
        (self.fingerprints.len() + self.overflow.len()) as u64
    }

    pub fn perfect_count(&self) -> u64 {
        self.fingerprints.len() as u64
    }

    /// Steps 3–5 of the common query procedure.
    #[inline]
    pub fn resolve(&self, fp: u64, candidate: Option<u64>) -> Option<u64> {
        if let Some(s) = candidate {
            if (s as usize) < self.fingerprints.len() && self.fingerprints[s as usize] == fp {
                return Some(s);
            }
        }
        self.overflow.find(fp).map(u64::from)
    }

    /// True only for keys served by the perfect placement itself.
    #[inline]
    pub fn is_perfect_hit(&self, fp: u64, candidate: Option<u64>) -> bool {
        matches!(candidate,
            Some(s) if (s as usize) < self.fingerprints.len()
                && self.fingerprints[s as usize] == fp)
    }

    pub fn memory_bytes(&self) -> usize {
        self.fingerprints.len() * 8 + self.overflow.memory_bytes()
    }

    pub fn write(&self, w: &mut WireWriter) {
        w.put_u64_slice(&self.fingerprints);
        self.overflow.write(w);
    }

    pub fn read(r: &mut WireReader<'_>) -> Result<Self> {
        let fingerprints = r.get_u64_vec()?;
        let overflow = OverflowTable::read(r)?;
        Ok(Self {
            fingerprints,
            overflow,
        })
    }
}

// ── config & stats ───────────────────────────────────────────────────────────

/// Build-time parameters for the whole family. Fields irrelevant to the
/// chosen algorithm are ignored.
#[derive(Debug, Clone)]
pub struct MphfConfig {
    pub kind: MphfKind,
    pub seed: u64,
    /// RecSplit leaf size, 4..=16.
    pub leaf_size: u32,
    /// CHD average bucket size.
    pub lambda: f64,
    /// BBHash level count, 1..=10.
    pub levels: u32,
    /// BBHash bit-array expansion factor.
    pub gamma: f64,
    /// PTHash target load factor, 0.80..=0.99.
    pub alpha: f64,
    /// FCH average bucket size.
    pub bucket_size: f64,
}

impl Default for MphfConfig {
    fn default() -> Self {
        Self {
            kind: MphfKind::RecSplit,
            seed: DEFAULT_SEED,
            leaf_size: 8,
            lambda: 5.0,
            levels: 3,
            gamma: 2.0,
            alpha: 0.98,
            bucket_size: 4.0,
        }
    }
}

impl MphfConfig {
    pub fn new(kind: MphfKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn leaf_size(mut self, leaf_size: u32) -> Self {
        self.leaf_size = leaf_size.clamp(4, 16);
        self
    }

    pub fn lambda(mut self, lambda: f64) -> Self {
        self.lambda = lambda.max(1.0);
        self
    }

    pub fn bucket_size(mut self, bucket_size: f64) -> Self {
        self.bucket_size = bucket_size.max(1.0);
        self
    }

    pub fn gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma.clamp(1.0, 10.0);
        self
    }

    pub fn levels(mut self, levels: u32) -> Self {
        self.levels = levels.clamp(1, 10);
        self
    }

    pub fn alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha.clamp(0.80, 0.99);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MphfStats {
    pub key_count: u64,
    pub perfect_count: u64,
    pub overflow_count: u64,
    /// Algorithmic structures only (buckets, bit arrays, pilots,
    /// fingerprints, overflow) — not fixed struct overhead.
    pub memory_bytes: usize,
    pub bits_per_key: f64,
}

impl MphfStats {
    pub(crate) fn new(table: &FingerprintTable, algo_memory: usize) -> Self {
        let key_count = table.key_count();
        let memory_bytes = table.memory_bytes() + algo_memory;
        Self {
            key_count,
            perfect_count: table.perfect_count(),
            overflow_count: table.overflow.len() as u64,
            memory_bytes,
            bits_per_key: if key_count == 0 {
                0.0
            } else {
                8.0 * memory_bytes as f64 / key_count as f64
            },
        }
    }
}

// ── dispatch enum ────────────────────────────────────────────────────────────

/// An immutable, queryable MPHF of any construction.
#[derive(Debug, Clone)]
pub enum Mphf {
    RecSplit(RecSplitMphf),
    Chd(ChdMphf),
    BbHash(BbHashMphf),
    PtHash(PtHashMphf),
    Fch(FchMphf),
}

impl Mphf {
    /// Build over `keys` with the configured algorithm. Fails only on an
    /// empty input; placement failures spill to overflow instead.
    pub fn build(keys: &[Vec<u8>], config: &MphfConfig) -> Result<Self> {
        let keys = keys.iter().cloned();
        match config.kind {
            MphfKind::RecSplit => Ok(Mphf::RecSplit(
                RecSplitBuilder::new()
                    .with_seed(config.seed)
                    .leaf_size(config.leaf_size)
                    .add_all(keys)
                    .build()?,
            )),
            MphfKind::Chd => Ok(Mphf::Chd(
                ChdBuilder::new()
                    .with_seed(config.seed)
                    .lambda(config.lambda)
                    .add_all(keys)
                    .build()?,
            )),
            MphfKind::BbHash => Ok(Mphf::BbHash(
                BbHashBuilder::new()
                    .with_seed(config.seed)
                    .gamma(config.gamma)
                    .levels(config.levels)
                    .add_all(keys)
                    .build()?,
            )),
            MphfKind::PtHash => Ok(Mphf::PtHash(
                PtHashBuilder::new()
                    .with_seed(config.seed)
                    .alpha(config.alpha)
                    .add_all(keys)
                    .build()?,
            )),
            MphfKind::Fch => Ok(Mphf::Fch(
                FchBuilder::new()
                    .with_seed(config.seed)
                    .bucket_size(config.bucket_size)
                    .add_all(keys)
                    .build()?,
            )),
            MphfKind::None => Err(KilatError::OptimizationFailed("no algorithm selected")),
        }
    }

    pub fn kind(&self) -> MphfKind {
        match self {
            Mphf::RecSplit(_) => MphfKind::RecSplit,
            Mphf::Chd(_) => MphfKind::Chd,
            Mphf::BbHash(_) => MphfKind::BbHash,
            Mphf::PtHash(_) => MphfKind::PtHash,
            Mphf::Fch(_) => MphfKind::Fch,
        }
    }

    /// Unique index in `[0, key_count)` for a member key, none otherwise
    /// (up to the fingerprint false-match bound).
    pub fn slot_for(&self, key: &[u8]) -> Option<u64> {
        match self {
            Mphf::RecSplit(h) => h.slot_for(key),
            Mphf::Chd(h) => h.slot_for(key),
            Mphf::BbHash(h) => h.slot_for(key),
            Mphf::PtHash(h) => h.slot_for(key),
            Mphf::Fch(h) => h.slot_for(key),
        }
    }

    /// Like [`slot_for`](Self::slot_for) but with `key_count` as the
    /// absent sentinel.
    pub fn hash(&self, key: &[u8]) -> u64 {
        self.slot_for(key).unwrap_or_else(|| self.key_count())
    }

    pub fn is_perfect_for(&self, key: &[u8]) -> bool {
        match self {
            Mphf::RecSplit(h) => h.is_perfect_for(key),
            Mphf::Chd(h) => h.is_perfect_for(key),
            Mphf::BbHash(h) => h.is_perfect_for(key),
            Mphf::PtHash(h) => h.is_perfect_for(key),
            Mphf::Fch(h) => h.is_perfect_for(key),
        }
    }

    pub fn key_count(&self) -> u64 {
        match self {
            Mphf::RecSplit(h) => h.key_count(),
            Mphf::Chd(h) => h.key_count(),
            Mphf::BbHash(h) => h.key_count(),
            Mphf::PtHash(h) => h.key_count(),
            Mphf::Fch(h) => h.key_count(),
        }
    }

    pub fn statistics(&self) -> MphfStats {
        match self {
            Mphf::RecSplit(h) => h.statistics(),
            Mphf::Chd(h) => h.statistics(),
            Mphf::BbHash(h) => h.statistics(),
            Mphf::PtHash(h) => h.statistics(),
            Mphf::Fch(h) => h.statistics(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Mphf::RecSplit(h) => h.serialize(),
            Mphf::Chd(h) => h.serialize(),
            Mphf::BbHash(h) => h.serialize(),
            Mphf::PtHash(h) => h.serialize(),
            Mphf::Fch(h) => h.serialize(),
        }
    }

    /// Dispatch on the payload's algorithm id.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        match WireReader::peek_kind(bytes)? {
            MphfKind::RecSplit => Ok(Mphf::RecSplit(RecSplitMphf::deserialize(bytes)?)),
            MphfKind::Chd => Ok(Mphf::Chd(ChdMphf::deserialize(bytes)?)),
            MphfKind::BbHash => Ok(Mphf::BbHash(BbHashMphf::deserialize(bytes)?)),
            MphfKind::PtHash => Ok(Mphf::PtHash(PtHashMphf::deserialize(bytes)?)),
            MphfKind::Fch => Ok(Mphf::Fch(FchMphf::deserialize(bytes)?)),
            MphfKind::None => Err(KilatError::InvalidFormat("unknown algorithm id")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_nonzero_and_stable() {
        assert_ne!(fingerprint(b""), 0);
        assert_ne!(fingerprint(b"key"), 0);
        assert_eq!(fingerprint(b"key"), fingerprint(b"key"));
        assert_ne!(fingerprint(b"key"), fingerprint(b"kez"));
    }

    #[test]
    fn test_overflow_scan() {
        let mut ovf = OverflowTable::default();
        for i in 0..13u32 {
            ovf.push(1000 + i as u64, 50 + i);
        }
        assert_eq!(ovf.find(1000), Some(50));
        assert_eq!(ovf.find(1012), Some(62));
        assert_eq!(ovf.find(999), None);
        assert_eq!(ovf.len(), 13);
    }

    #[test]
    fn test_sorted_dedup() {
        let keys = vec![b"b".to_vec(), b"a".to_vec(), b"b".to_vec()];
        assert_eq!(sorted_dedup(keys), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_build_rejects_empty() {
        for kind in [
            MphfKind::RecSplit,
            MphfKind::Chd,
            MphfKind::BbHash,
            MphfKind::PtHash,
            MphfKind::Fch,
        ] {
            let cfg = MphfConfig::new(kind);
            assert!(matches!(
                Mphf::build(&[], &cfg),
                Err(KilatError::OptimizationFailed(_))
            ));
        }
    }
}
