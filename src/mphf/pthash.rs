//! PTHash-style construction: one group per key (conservative but
//! reliable), groups processed largest-first, and per group a 16-bit
//! pilot `p` is searched so that `mix(hash(key) ⊕ p) mod table_size`
//! lands every member on a free slot of a table sized N/α. Dense indices
//! are handed out in placement order through a sparse→dense map.

use super::wire::{WireReader, WireWriter};
use super::{
    fingerprint, mix64, place_hash, sorted_dedup, FingerprintTable, MphfStats, OverflowTable,
    DEFAULT_SEED, NO_SLOT, SPILLED,
};
use crate::error::{KilatError, Result};
use crate::types::MphfKind;
use tracing::debug;

/// Pilot search budget per group.
const PILOT_RANGE: u32 = 16_384;

#[derive(Debug, Clone)]
pub struct PtHashMphf {
    seed: u64,
    table_size: u64,
    /// Pilot per group, [`SPILLED`] when the budget ran out.
    pilots: Vec<u32>,
    /// Sparse position → dense index, [`NO_SLOT`] when unused.
    positions: Vec<u32>,
    table: FingerprintTable,
}

pub struct PtHashBuilder {
    keys: Vec<Vec<u8>>,
    seed: u64,
    alpha: f64,
}

impl Default for PtHashBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PtHashBuilder {
    pub fn new() -> Self {
        Self {
            keys: Vec::new(),
            seed: DEFAULT_SEED,
            alpha: 0.98,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Target load factor, 0.80..=0.99.
    pub fn alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha.clamp(0.80, 0.99);
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

    pub fn build(self) -> Result<PtHashMphf> {
        let keys = sorted_dedup(self.keys);
        if keys.is_empty() {
            return Err(KilatError::OptimizationFailed("empty key set"));
        }
        let n = keys.len();
        let seed = self.seed;
        let num_groups = n as u64;
        let table_size = ((n as f64 / self.alpha).ceil() as u64).max(n as u64);

        let key_hash: Vec<u64> = keys.iter().map(|k| place_hash(k, seed)).collect();
        let mut groups: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, &h) in key_hash.iter().enumerate() {
            groups[(h % num_groups) as usize].push(i);
        }

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&g| (std::cmp::Reverse(groups[g].len()), g));

        let mut used = vec![false; table_size as usize];
        let mut positions = vec![NO_SLOT; table_size as usize];
        let mut pilots = vec![0u32; n];
        let mut fingerprints = Vec::with_capacity(n);
        let mut spilled: Vec<usize> = Vec::new();
        let mut scratch: Vec<u64> = Vec::new();

        for &g in &order {
            let members = &groups[g];
            if members.is_empty() {
                continue;
            }
            let mut placed = false;
            'pilot: for p in 0..PILOT_RANGE {
                scratch.clear();
                for &ki in members {
                    let pos = mix64(key_hash[ki] ^ p as u64) % table_size;
                    if used[pos as usize] || scratch.contains(&pos) {
                        continue 'pilot;
                    }
                    scratch.push(pos);
                }
                for (&ki, &pos) in members.iter().zip(scratch.iter()) {
                    used[pos as usize] = true;
                    positions[pos as usize] = fingerprints.len() as u32;
                    fingerprints.push(fingerprint(&keys[ki]));
                }
                pilots[g] = p;
                placed = true;
                break;
            }
            if !placed {
                pilots[g] = SPILLED;
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
            debug!(keys = n, overflow = overflow.len(), "pthash build spilled keys");
        }

        Ok(PtHashMphf {
            seed,
            table_size,
            pilots,
            positions,
            table: FingerprintTable {
                fingerprints,
                overflow,
            },
        })
    }
}

impl PtHashMphf {
    #[inline]
    fn candidate(&self, key: &[u8]) -> Option<u64> {
        let h = place_hash(key, self.seed);
        let g = (h % self.pilots.len() as u64) as usize;
        let p = self.pilots[g];
        if p == SPILLED {
            return None;
        }
        let pos = mix64(h ^ p as u64) % self.table_size;
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
        let algo = self.pilots.len() * 4 + self.positions.len() * 4;
        MphfStats::new(&self.table, algo)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = WireWriter::new(MphfKind::PtHash);
        w.put_u64(self.seed);
        w.put_u64(self.table_size);
        w.put_u32_slice(&self.pilots);
        w.put_u32_slice(&self.positions);
        self.table.write(&mut w);
        w.finish()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes, MphfKind::PtHash)?;
        let seed = r.get_u64()?;
        let table_size = r.get_u64()?;
        let pilots = r.get_u32_vec()?;
        let positions = r.get_u32_vec()?;
        let table = FingerprintTable::read(&mut r)?;
        r.expect_eof()?;

        if pilots.is_empty() || positions.len() as u64 != table_size {
            return Err(KilatError::InvalidFormat("inconsistent pthash payload"));
        }

        Ok(Self {
            seed,
            table_size,
            pilots,
            positions,
            table,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("pthash-key-{i}").into_bytes()).collect()
    }

    #[test]
    fn test_bijection() {
        let ks = keys(1200);
        let h = PtHashBuilder::new().add_all(ks.clone()).build().unwrap();
        let mut seen = vec![false; ks.len()];
        for k in &ks {
            let s = h.slot_for(k).expect("member key must resolve") as usize;
            assert!(s < ks.len());
            assert!(!seen[s]);
            seen[s] = true;
        }
        assert_eq!(h.slot_for(b"missing"), None);
    }

    #[test]
    fn test_tight_alpha_still_bijective() {
        let ks = keys(800);
        let h = PtHashBuilder::new().alpha(0.99).add_all(ks.clone()).build().unwrap();
        let mut seen = vec![false; ks.len()];
        for k in &ks {
            let s = h.slot_for(k).unwrap() as usize;
            assert!(!seen[s]);
            seen[s] = true;
        }
    }

    #[test]
    fn test_deterministic() {
        let ks = keys(300);
        let a = PtHashBuilder::new().with_seed(99).add_all(ks.clone()).build().unwrap();
        let b = PtHashBuilder::new().with_seed(99).add_all(ks.clone()).build().unwrap();
        for k in &ks {
            assert_eq!(a.slot_for(k), b.slot_for(k));
        }
    }

    #[test]
    fn test_serialize_round_trip() {
        let ks = keys(200);
        let h = PtHashBuilder::new().add_all(ks.clone()).build().unwrap();
        let h2 = PtHashMphf::deserialize(&h.serialize()).unwrap();
        for k in &ks {
            assert_eq!(h.slot_for(k), h2.slot_for(k));
        }
    }
}
