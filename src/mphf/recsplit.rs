//! RecSplit-style construction: partition keys into small buckets, then
//! brute-force a per-bucket split seed under which every key in the
//! bucket lands on a distinct local slot. Global slots come from a prefix
//! sum over placed bucket sizes. Bucket searches are independent, so the
//! placement runs on the rayon pool; output is deterministic for a fixed
//! seed.

use super::wire::{WireReader, WireWriter};
use super::{
    fingerprint, place_hash, sorted_dedup, FingerprintTable, MphfStats, OverflowTable, C1, C2,
    DEFAULT_SEED, SPILLED,
};
use crate::error::{KilatError, Result};
use crate::types::MphfKind;
use rayon::prelude::*;
use tracing::debug;

/// Split seeds tried per bucket before spilling it.
const SEED_RANGE: u32 = 10_000;

#[inline]
fn bucket_seed(base: u64, bucket: usize, seed: u32) -> u64 {
    base ^ (bucket as u64).wrapping_mul(C1) ^ (seed as u64).wrapping_mul(C2)
}

#[derive(Debug, Clone)]
pub struct RecSplitMphf {
    base_seed: u64,
    leaf_size: u32,
    /// Found split seed per bucket, [`SPILLED`] when the bucket overflowed.
    bucket_seeds: Vec<u32>,
    /// Prefix sum of placed bucket sizes, one past the bucket count.
    offsets: Vec<u32>,
    table: FingerprintTable,
}

pub struct RecSplitBuilder {
    keys: Vec<Vec<u8>>,
    seed: u64,
    leaf_size: u32,
}

impl Default for RecSplitBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RecSplitBuilder {
    pub fn new() -> Self {
        Self {
            keys: Vec::new(),
            seed: DEFAULT_SEED,
            leaf_size: 8,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn leaf_size(mut self, leaf_size: u32) -> Self {
        self.leaf_size = leaf_size.clamp(4, 16);
        self
    }

    pub fn add(mut self, key: &[u8]) -> Self {
        self.keys.push(key.to_vec());
        self
    }

    pub fn add_all<I: IntoIterator<Item = Vec<u8>>>(mut self, keys: I) -> Self {
        self.keys.extend(keys);
        self
    }

    pub fn build(self) -> Result<RecSplitMphf> {
        let keys = sorted_dedup(self.keys);
        if keys.is_empty() {
            return Err(KilatError::OptimizationFailed("empty key set"));
        }
        let n = keys.len();
        let leaf = self.leaf_size as usize;
        let seed = self.seed;
        let num_buckets = (4 * n / leaf).max(1);
        let max_bucket = 3 * leaf;

        let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); num_buckets];
        for (i, key) in keys.iter().enumerate() {
            let b = (place_hash(key, seed) % num_buckets as u64) as usize;
            buckets[b].push(i);
        }

        // Independent per-bucket seed search.
        let found: Vec<Option<u32>> = buckets
            .par_iter()
            .enumerate()
            .map(|(b, members)| {
                if members.is_empty() {
                    return Some(0);
                }
                if members.len() > max_bucket {
                    return None;
                }
                let size = members.len() as u64;
                'seed: for s in 0..SEED_RANGE {
                    let bs = bucket_seed(seed, b, s);
                    // max_bucket ≤ 48, so a u64 occupancy mask suffices
                    let mut mask = 0u64;
                    for &ki in members {
                        let local = place_hash(&keys[ki], bs) % size;
                        if mask >> local & 1 == 1 {
                            continue 'seed;
                        }
                        mask |= 1 << local;
                    }
                    return Some(s);
                }
                None
            })
            .collect();

        let mut offsets = Vec::with_capacity(num_buckets + 1);
        let mut acc = 0u32;
        for (b, members) in buckets.iter().enumerate() {
            offsets.push(acc);
            if found[b].is_some() {
                acc += members.len() as u32;
            }
        }
        offsets.push(acc);

        let mut fingerprints = vec![0u64; acc as usize];
        let mut overflow = OverflowTable::default();
        let mut next_slot = acc;
        for (b, members) in buckets.iter().enumerate() {
            match found[b] {
                Some(s) => {
                    let bs = bucket_seed(seed, b, s);
                    let size = members.len() as u64;
                    for &ki in members {
                        let local = place_hash(&keys[ki], bs) % size;
                        fingerprints[offsets[b] as usize + local as usize] =
                            fingerprint(&keys[ki]);
                    }
                }
                None => {
                    for &ki in members {
                        overflow.push(fingerprint(&keys[ki]), next_slot);
                        next_slot += 1;
                    }
                }
            }
        }

        if !overflow.is_empty() {
            debug!(
                keys = n,
                overflow = overflow.len(),
                "recsplit build spilled keys"
            );
        }

        Ok(RecSplitMphf {
            base_seed: seed,
            leaf_size: self.leaf_size,
            bucket_seeds: found
                .into_iter()
                .map(|s| s.unwrap_or(SPILLED))
                .collect(),
            offsets,
            table: FingerprintTable {
                fingerprints,
                overflow,
            },
        })
    }
}

impl RecSplitMphf {
    #[inline]
    fn candidate(&self, key: &[u8]) -> Option<u64> {
        let b = (place_hash(key, self.base_seed) % self.bucket_seeds.len() as u64) as usize;
        let s = self.bucket_seeds[b];
        if s == SPILLED {
            return None;
        }
        let size = (self.offsets[b + 1] - self.offsets[b]) as u64;
        if size == 0 {
            return None;
        }
        let local = place_hash(key, bucket_seed(self.base_seed, b, s)) % size;
        Some(self.offsets[b] as u64 + local)
    }

    pub fn slot_for(&self, key: &[u8]) -> Option<u64> {
        self.table.resolve(fingerprint(key), self.candidate(key))
    }

    pub fn hash(&self, key: &[u8]) -> u64 {
        self.slot_for(key).unwrap_or_else(|| self.key_count())
    }

    pub fn is_perfect_for(&self, key: &[u8]) -> bool {
        self.table
            .is_perfect_hit(fingerprint(key), self.candidate(key))
    }

    pub fn key_count(&self) -> u64 {
        self.table.key_count()
    }

    pub fn statistics(&self) -> MphfStats {
        let algo = self.bucket_seeds.len() * 4 + self.offsets.len() * 4;
        MphfStats::new(&self.table, algo)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = WireWriter::new(MphfKind::RecSplit);
        w.put_u64(self.base_seed);
        w.put_u32(self.leaf_size);
        w.put_u32_slice(&self.bucket_seeds);
        w.put_u32_slice(&self.offsets);
        self.table.write(&mut w);
        w.finish()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes, MphfKind::RecSplit)?;
        let base_seed = r.get_u64()?;
        let leaf_size = r.get_u32()?;
        let bucket_seeds = r.get_u32_vec()?;
        let offsets = r.get_u32_vec()?;
        let table = FingerprintTable::read(&mut r)?;
        r.expect_eof()?;

        if bucket_seeds.is_empty()
            || offsets.len() != bucket_seeds.len() + 1
            || offsets.windows(2).any(|w| w[0] > w[1])
            || *offsets.last().unwrap() as u64 != table.perfect_count()
        {
            return Err(KilatError::InvalidFormat("inconsistent recsplit payload"));
        }

        Ok(Self {
            base_seed,
            leaf_size,
            bucket_seeds,
            offsets,
            table,
        })
    }
}
