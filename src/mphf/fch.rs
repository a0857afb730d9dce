//! FCH-style construction: ~N/bucket_size buckets displaced into a
//! roomy 3N table. Like CHD but with a 32-bit displacement space under a
//! fixed search budget, which makes placement failures rare even for
//! skewed buckets.

use super::wire::{WireReader, WireWriter};
use super::{
    fingerprint, place_hash, sorted_dedup, FingerprintTable, MphfStats, OverflowTable, C2,
    DEFAULT_SEED, NO_SLOT, SPILLED,
};
use crate::error::{KilatError, Result};
use crate::types::MphfKind;
use tracing::debug;

/// Displacements tried per bucket. The space is 32-bit; searching it
/// exhaustively is pointless, exhaustion just spills the bucket.
const DISPLACEMENT_BUDGET: u32 = 1 << 18;

#[derive(Debug, Clone)]
pub struct FchMphf {
    seed: u64,
    table_size: u64,
    /// Displacement per bucket, [`SPILLED`] when the budget ran out.
    displacements: Vec<u32>,
    /// Sparse position → dense index, [`NO_SLOT`] when unused.
    positions: Vec<u32>,
    table: FingerprintTable,
}

pub struct FchBuilder {
    keys: Vec<Vec<u8>>,
    seed: u64,
    bucket_size: f64,
}

impl Default for FchBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FchBuilder {
    pub fn new() -> Self {
        Self {
            keys: Vec::new(),
            seed: DEFAULT_SEED,
            bucket_size: 4.0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Target average bucket size.
    pub fn bucket_size(mut self, bucket_size: f64) -> Self {
        self.bucket_size = bucket_size.max(1.0);
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

    pub fn build(self) -> Result<FchMphf> {
        let keys = sorted_dedup(self.keys);
        if keys.is_empty() {
            return Err(KilatError::OptimizationFailed("empty key set"));
        }
        let n = keys.len();
        let seed = self.seed;
        let num_buckets = ((n as f64 / self.bucket_size).ceil() as usize).max(1);
        let table_size = 3 * n as u64;

        let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); num_buckets];
        for (i, key) in keys.iter().enumerate() {
            let b = (place_hash(key, seed) % num_buckets as u64) as usize;
            buckets[b].push(i);
        }
        let pos_hash: Vec<u64> = keys.iter().map(|k| place_hash(k, seed ^ C2)).collect();

        let mut order: Vec<usize> = (0..num_buckets).collect();
        order.sort_by_key(|&b| (std::cmp::Reverse(buckets[b].len()), b));

        let mut used = vec![false; table_size as usize];
        let mut positions = vec![NO_SLOT; table_size as usize];
        let mut displacements = vec![0u32; num_buckets];
        let mut fingerprints = Vec::with_capacity(n);
        let mut spilled: Vec<usize> = Vec::new();
        let mut scratch: Vec<u64> = Vec::new();

        for &b in &order {
            let members = &buckets[b];
            if members.is_empty() {
                continue;
            }
            let mut placed = false;
            'disp: for d in 0..DISPLACEMENT_BUDGET {
                scratch.clear();
                for &ki in members {
                    let pos = (pos_hash[ki].wrapping_add(d as u64)) % table_size;
                    if used[pos as usize] || scratch.contains(&pos) {
                        continue 'disp;
                    }
                    scratch.push(pos);
                }
                for (&ki, &pos) in members.iter().zip(scratch.iter()) {
                    used[pos as usize] = true;
                    positions[pos as usize] = fingerprints.len() as u32;
                    fingerprints.push(fingerprint(&keys[ki]));
                }
                displacements[b] = d;
                placed = true;
                break;
            }
            if !placed {
                displacements[b] = SPILLED;
                spilled.extend_from_slice(members);
            }
        }

        let mut overflow = OverflowTable::default();
        let mut next_slot = fingerprints.len() as u32;
        for ki in spilled {
            overflow.push(fingerprint(&keys[ki]), next_slot);
            next_slot += 1;
        }

        if !overflow.is_empty() {
            debug!(keys = n, overflow = overflow.len(), "fch build spilled keys");
        }

        Ok(FchMphf {
            seed,
            table_size,
            displacements,
            positions,
            table: FingerprintTable {
                fingerprints,
                overflow,
            },
        })
    }
}

impl FchMphf {
    #[inline]
    fn candidate(&self, key: &[u8]) -> Option<u64> {
        let b = (place_hash(key, self.seed) % self.displacements.len() as u64) as usize;
        let d = self.displacements[b];
        if d == SPILLED {
            return None;
        }
        let pos = place_hash(key, self.seed ^ C2).wrapping_add(d as u64) % self.table_size;
        match self.positions[pos as usize] {
            NO_SLOT => None,
            dense => Some(dense as u64),
        }
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
        let algo = self.displacements.len() * 4 + self.positions.len() * 4;
        MphfStats::new(&self.table, algo)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = WireWriter::new(MphfKind::Fch);
        w.put_u64(self.seed);
        w.put_u64(self.table_size);
        w.put_u32_slice(&self.displacements);
        w.put_u32_slice(&self.positions);
        self.table.write(&mut w);
        w.finish()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes, MphfKind::Fch)?;
        let seed = r.get_u64()?;
        let table_size = r.get_u64()?;
        let displacements = r.get_u32_vec()?;
        let positions = r.get_u32_vec()?;
        let table = FingerprintTable::read(&mut r)?;
        r.expect_eof()?;

        if displacements.is_empty() || positions.len() as u64 != table_size {
            return Err(KilatError::InvalidFormat("inconsistent fch payload"));
        }

        Ok(Self {
            seed,
            table_size,
            displacements,
            positions,
            table,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("fch-key-{i}").into_bytes()).collect()
    }

    #[test]
    fn test_bijection() {
        let ks = keys(1000);
        let h = FchBuilder::new().add_all(ks.clone()).build().unwrap();
        let mut seen = vec![false; ks.len()];
        for k in &ks {
            let s = h.slot_for(k).expect("member key must resolve") as usize;
            assert!(s < ks.len());
            assert!(!seen[s]);
            seen[s] = true;
        }
        assert_eq!(h.slot_for(b"absent"), None);
    }

    #[test]
    fn test_deterministic() {
        let ks = keys(350);
        let a = FchBuilder::new().with_seed(21).add_all(ks.clone()).build().unwrap();
        let b = FchBuilder::new().with_seed(21).add_all(ks.clone()).build().unwrap();
        for k in &ks {
            assert_eq!(a.slot_for(k), b.slot_for(k));
        }
    }

    #[test]
    fn test_serialize_round_trip() {
        let ks = keys(180);
        let h = FchBuilder::new().add_all(ks.clone()).build().unwrap();
        let h2 = FchMphf::deserialize(&h.serialize()).unwrap();
        for k in &ks {
            assert_eq!(h.slot_for(k), h2.slot_for(k));
        }
    }

    #[test]
    fn test_big_buckets_still_place() {
        // bucket_size 16 forces large buckets through the wide budget
        let ks = keys(640);
        let h = FchBuilder::new().bucket_size(16.0).add_all(ks.clone()).build().unwrap();
        for k in &ks {
            assert!(h.slot_for(k).is_some());
        }
    }
}
