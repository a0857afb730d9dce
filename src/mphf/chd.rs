//! CHD-style construction (compress–hash–displace): hash keys into
//! ~N/λ buckets, process buckets largest-first, and for each bucket find
//! a 16-bit displacement under which every member lands on an unused slot
//! of a 2N-wide sparse table. Dense indices are handed out in placement
//! order through a sparse→dense map.

use super::wire::{WireReader, WireWriter};
use super::{
    fingerprint, place_hash, sorted_dedup, FingerprintTable, MphfStats, OverflowTable, C1,
    DEFAULT_SEED, NO_SLOT, SPILLED,
};
use crate::error::{KilatError, Result};
use crate::types::MphfKind;
use tracing::debug;

/// 16-bit displacement space.
const DISPLACEMENT_RANGE: u32 = 1 << 16;

#[derive(Debug, Clone)]
pub struct ChdMphf {
    seed: u64,
    table_size: u64,
    /// Displacement per bucket, [`SPILLED`] when none worked.
    displacements: Vec<u32>,
    /// Sparse position → dense index, [`NO_SLOT`] when unused.
    positions: Vec<u32>,
    table: FingerprintTable,
}

pub struct ChdBuilder {
    keys: Vec<Vec<u8>>,
    seed: u64,
    lambda: f64,
}

impl Default for ChdBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChdBuilder {
    pub fn new() -> Self {
        Self {
            keys: Vec::new(),
            seed: DEFAULT_SEED,
            lambda: 5.0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Target average bucket size.
    pub fn lambda(mut self, lambda: f64) -> Self {
        self.lambda = lambda.max(1.0);
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

    pub fn build(self) -> Result<ChdMphf> {
        let keys = sorted_dedup(self.keys);
        if keys.is_empty() {
            return Err(KilatError::OptimizationFailed("empty key set"));
        }
        let n = keys.len();
        let seed = self.seed;
        let num_buckets = ((n as f64 / self.lambda).ceil() as usize).max(1);
        let table_size = 2 * n as u64;

        let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); num_buckets];
        for (i, key) in keys.iter().enumerate() {
            let b = (place_hash(key, seed) % num_buckets as u64) as usize;
            buckets[b].push(i);
        }
        // Position hash, precomputed once per key.
        let pos_hash: Vec<u64> = keys.iter().map(|k| place_hash(k, seed ^ C1)).collect();

        // Largest buckets first; ties broken by index for determinism.
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
            'disp: for d in 0..DISPLACEMENT_RANGE {
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
            debug!(keys = n, overflow = overflow.len(), "chd build spilled keys");
        }

        Ok(ChdMphf {
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

impl ChdMphf {
    #[inline]
    fn candidate(&self, key: &[u8]) -> Option<u64> {
        let b = (place_hash(key, self.seed) % self.displacements.len() as u64) as usize;
        let d = self.displacements[b];
        if d == SPILLED {
            return None;
        }
        let pos = place_hash(key, self.seed ^ C1).wrapping_add(d as u64) % self.table_size;
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
        let mut w = WireWriter::new(MphfKind::Chd);
        w.put_u64(self.seed);
        w.put_u64(self.table_size);
        w.put_u32_slice(&self.displacements);
        w.put_u32_slice(&self.positions);
        self.table.write(&mut w);
        w.finish()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes, MphfKind::Chd)?;
        let seed = r.get_u64()?;
        let table_size = r.get_u64()?;
        let displacements = r.get_u32_vec()?;
        let positions = r.get_u32_vec()?;
        let table = FingerprintTable::read(&mut r)?;
        r.expect_eof()?;

        if displacements.is_empty() || positions.len() as u64 != table_size {
            return Err(KilatError::InvalidFormat("inconsistent chd payload"));
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
