//! BBHash-style construction: cascade of bit arrays. At each level every
//! remaining key hashes into a γ-expanded bit array; positions targeted
//! by exactly one key are placed there, colliding keys fall through to
//! the next level. Dense indices combine the per-level placed counts with
//! an O(1) rank over the level's bit array.

use super::rank::{BitSet, RankedBits};
use super::wire::{WireReader, WireWriter};
use super::{
    fingerprint, place_hash, sorted_dedup, FingerprintTable, MphfStats, OverflowTable, C1,
    DEFAULT_SEED,
};
use crate::error::{KilatError, Result};
use crate::types::MphfKind;
use tracing::debug;

#[inline]
fn level_seed(base: u64, level: usize) -> u64 {
    base.wrapping_add((level as u64).wrapping_mul(C1))
}

#[derive(Debug, Clone)]
pub struct BbHashMphf {
    seed: u64,
    gamma: f64,
    levels: Vec<RankedBits>,
    /// Cumulative placed keys before each level; derived, not serialized.
    level_offsets: Vec<u64>,
    table: FingerprintTable,
}

pub struct BbHashBuilder {
    keys: Vec<Vec<u8>>,
    seed: u64,
    gamma: f64,
    num_levels: u32,
}

impl Default for BbHashBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BbHashBuilder {
    pub fn new() -> Self {
        Self {
            keys: Vec::new(),
            seed: DEFAULT_SEED,
            gamma: 2.0,
            num_levels: 3,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Bit-array expansion factor, 1..=10.
    pub fn gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma.clamp(1.0, 10.0);
        self
    }

    /// Level count, 1..=10.
    pub fn levels(mut self, levels: u32) -> Self {
        self.num_levels = levels.clamp(1, 10);
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

    pub fn build(self) -> Result<BbHashMphf> {
        let keys = sorted_dedup(self.keys);
        if keys.is_empty() {
            return Err(KilatError::OptimizationFailed("empty key set"));
        }
        let n = keys.len();
        let seed = self.seed;

        let mut remaining: Vec<usize> = (0..n).collect();
        let mut levels: Vec<RankedBits> = Vec::new();
        let mut level_placed: Vec<Vec<(usize, u64)>> = Vec::new();

        for level in 0..self.num_levels as usize {
            if remaining.is_empty() {
                break;
            }
            let size = ((self.gamma * remaining.len() as f64).ceil() as u64).max(1);
            let ls = level_seed(seed, level);

            let mut seen = BitSet::new(size);
            let mut collide = BitSet::new(size);
            for &ki in &remaining {
                let pos = place_hash(&keys[ki], ls) % size;
                if seen.get(pos) {
                    collide.set(pos);
                } else {
                    seen.set(pos);
                }
            }

            let mut bits = BitSet::new(size);
            let mut placed = Vec::new();
            let mut survivors = Vec::new();
            for &ki in &remaining {
                let pos = place_hash(&keys[ki], ls) % size;
                if collide.get(pos) {
                    survivors.push(ki);
                } else {
                    bits.set(pos);
                    placed.push((ki, pos));
                }
            }

            levels.push(bits.into_ranked());
            level_placed.push(placed);
            remaining = survivors;
        }

        let mut level_offsets = Vec::with_capacity(levels.len());
        let mut acc = 0u64;
        for level in &levels {
            level_offsets.push(acc);
            acc += level.ones();
        }

        let mut fingerprints = vec![0u64; acc as usize];
        for (l, placed) in level_placed.iter().enumerate() {
            for &(ki, pos) in placed {
                let dense = level_offsets[l] + levels[l].rank(pos);
                fingerprints[dense as usize] = fingerprint(&keys[ki]);
            }
        }

        let mut overflow = OverflowTable::default();
        let mut next_slot = acc as u32;
        for ki in remaining {
            overflow.push(fingerprint(&keys[ki]), next_slot);
            next_slot += 1;
        }

        if !overflow.is_empty() {
            debug!(
                keys = n,
                overflow = overflow.len(),
                levels = levels.len(),
                "bbhash build spilled keys"
            );
        }

        Ok(BbHashMphf {
            seed,
            gamma: self.gamma,
            levels,
            level_offsets,
            table: FingerprintTable {
                fingerprints,
                overflow,
            },
        })
    }
}

impl BbHashMphf {
    #[inline]
    fn candidate(&self, key: &[u8]) -> Option<u64> {
        for (l, bits) in self.levels.iter().enumerate() {
            let pos = place_hash(key, level_seed(self.seed, l)) % bits.len();
            if bits.get(pos) {
                return Some(self.level_offsets[l] + bits.rank(pos));
            }
        }
        None
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

    pub fn levels(&self) -> &[RankedBits] {
        &self.levels
    }

    pub fn statistics(&self) -> MphfStats {
        let algo: usize =
            self.levels.iter().map(|l| l.memory_bytes()).sum::<usize>() + self.level_offsets.len() * 8;
        MphfStats::new(&self.table, algo)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = WireWriter::new(MphfKind::BbHash);
        w.put_u64(self.seed);
        w.put_f64(self.gamma);
        w.put_u64(self.levels.len() as u64);
        for level in &self.levels {
            w.put_u64(level.len());
            w.put_u64_slice(level.words());
        }
        self.table.write(&mut w);
        w.finish()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes, MphfKind::BbHash)?;
        let seed = r.get_u64()?;
        let gamma = r.get_f64()?;
        let level_count = r.get_u64()? as usize;
        if level_count > 10 {
            return Err(KilatError::InvalidFormat("bbhash level count out of range"));
        }

        let mut levels = Vec::with_capacity(level_count);
        for _ in 0..level_count {
            let bits = r.get_u64()?;
            let words = r.get_u64_vec()?;
            if (words.len() as u64) * 64 < bits {
                return Err(KilatError::InvalidFormat("bbhash bit array truncated"));
            }
            levels.push(RankedBits::build(words, bits));
        }
        let table = FingerprintTable::read(&mut r)?;
        r.expect_eof()?;

        let mut level_offsets = Vec::with_capacity(levels.len());
        let mut acc = 0u64;
        for level in &levels {
            level_offsets.push(acc);
            acc += level.ones();
        }
        if acc != table.perfect_count() {
            return Err(KilatError::InvalidFormat("inconsistent bbhash payload"));
        }

        Ok(Self {
            seed,
            gamma,
            levels,
            level_offsets,
            table,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("bbhash-key-{i}").into_bytes()).collect()
    }

    #[test]
    fn test_bijection_with_default_params() {
        let ks = keys(1000);
        let h = BbHashBuilder::new().add_all(ks.clone()).build().unwrap();
        let mut seen = vec![false; ks.len()];
        for k in &ks {
            let s = h.slot_for(k).expect("member key must resolve") as usize;
            assert!(s < ks.len());
            assert!(!seen[s]);
            seen[s] = true;
        }
        assert_eq!(h.slot_for(b"outsider"), None);
    }

    #[test]
    fn test_level_rank_consistency() {
        let h = BbHashBuilder::new().add_all(keys(500)).build().unwrap();
        // Each level's rank directory agrees with a naive popcount prefix.
        for level in h.levels() {
            let mut naive = 0u64;
            for i in 0..level.len() {
                assert_eq!(level.rank(i), naive);
                if level.get(i) {
                    naive += 1;
                }
            }
            assert_eq!(level.ones(), naive);
        }
    }

    #[test]
    fn test_single_level_spills_survivors() {
        let ks = keys(300);
        let h = BbHashBuilder::new()
            .levels(1)
            .gamma(1.0)
            .add_all(ks.clone())
            .build()
            .unwrap();
        let stats = h.statistics();
        assert!(stats.overflow_count > 0, "one tight level must spill");
        // Spilled keys still resolve to unique indices.
        let mut seen = vec![false; ks.len()];
        for k in &ks {
            let s = h.slot_for(k).unwrap() as usize;
            assert!(!seen[s]);
            seen[s] = true;
        }
    }

    #[test]
    fn test_deterministic() {
        let ks = keys(400);
        let a = BbHashBuilder::new().with_seed(11).add_all(ks.clone()).build().unwrap();
        let b = BbHashBuilder::new().with_seed(11).add_all(ks.clone()).build().unwrap();
        for k in &ks {
            assert_eq!(a.slot_for(k), b.slot_for(k));
        }
    }

    #[test]
    fn test_serialize_round_trip() {
        let ks = keys(600);
        let h = BbHashBuilder::new().add_all(ks.clone()).build().unwrap();
        let h2 = BbHashMphf::deserialize(&h.serialize()).unwrap();
        for k in &ks {
            assert_eq!(h.slot_for(k), h2.slot_for(k));
        }
    }
}
