//! KilatDB — the dual-mode table.
//!
//! Routes get/set/remove through either the standard FNV-1a probe path or
//! the active minimal perfect hash, per the mode recorded in the header:
//!
//! ```text
//! standard ──optimize()──▶ perfect ──set(new key)──▶ hybrid
//! ```
//!
//! Physical slot placement is always probe-determined; the MPHF supplies
//! membership plus a dense identity, and an in-memory `slot_map` (dense
//! index → physical slot) bridges the two. The map is built by
//! `optimize()`, rebuilt on open from the journal, repaired by the writer
//! when it goes stale, and swapped atomically together with the MPHF
//! handle — so slot contents never move and readers on either side of a
//! mode flip stay correct.
//!
//! In pure perfect mode an MPHF miss is definitive and an unmapped dense
//! index means "removed": neither ever probes. Hybrid mode probes for
//! keys the MPHF does not know. When `open()` cannot rebuild the full
//! slot map (journal missing or inconsistent with the table), the handle
//! is demoted to hybrid so the probing fallback is taken honestly instead
//! of behind a perfect-mode label.

use crate::error::{KilatError, Result};
use crate::hasher::{fnv1a32, probe_sequence};
use crate::journal::{JournalStats, KeyJournal};
use crate::mphf::{Mphf, MphfConfig, MphfStats};
use crate::store::SlotStore;
use crate::types::{HashMode, MphfKind, Stats, SLOT_DATA_SIZE};
use ahash::AHashSet;
use parking_lot::RwLock;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// slot_map entry for "physical slot unknown".
const UNMAPPED: u64 = u64::MAX;

struct ActiveMphf {
    mphf: Mphf,
    /// MPHF dense index → physical slot. Writer-maintained.
    slot_map: RwLock<Vec<u64>>,
}

pub struct KilatDB {
    slots: SlotStore,
    /// `None` only on read-only handles.
    journal: Option<KeyJournal>,
    active: RwLock<Option<Arc<ActiveMphf>>>,
    /// Set by `open()` when the slot map could not be fully rebuilt; a
    /// perfect-mode header is then served with hybrid semantics.
    demoted_to_hybrid: bool,
}

fn journal_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push(".journal");
    PathBuf::from(os)
}

impl KilatDB {
    /// Create a fresh store of `slot_count` slots. Truncates any existing
    /// store and journal at `path` / `path.journal`.
    pub fn create(path: &Path, slot_count: u64) -> Result<Self> {
        let slots = SlotStore::create(path, slot_count)?;
        let journal = KeyJournal::create(&journal_path(path))?;
        Ok(Self {
            slots,
            journal: Some(journal),
            active: RwLock::new(None),
            demoted_to_hybrid: false,
        })
    }

    /// Open an existing store. A read-only handle rejects every mutation
    /// and never touches the journal writer; if the store was optimized,
    /// the journal is read once to rebuild the dense→physical slot map.
    pub fn open(path: &Path, readonly: bool) -> Result<Self> {
        let slots = SlotStore::open(path, readonly)?;
        let jpath = journal_path(path);
        // Checked before KeyJournal::open, which creates a missing file.
        let journal_present = jpath.exists();
        let journal = if readonly {
            None
        } else {
            Some(KeyJournal::open(&jpath)?)
        };
        let mut db = Self {
            slots,
            journal,
            active: RwLock::new(None),
            demoted_to_hybrid: false,
        };

        if db.mode() != HashMode::Standard {
            let header = db.slots.header();
            let offset = header.mphf_offset.load(Ordering::Acquire);
            let size = header.mphf_size.load(Ordering::Acquire);
            let payload = db.slots.read_payload(offset, size)?;
            let mphf = Mphf::deserialize(&payload)?;
            if MphfKind::from_u32(header.algorithm.load(Ordering::Acquire)) != Some(mphf.kind()) {
                return Err(KilatError::InvalidFormat("header/payload algorithm mismatch"));
            }

            let keys = match &db.journal {
                Some(j) => j.active_keys(),
                None => KeyJournal::load_active_keys(&jpath)?,
            };
            let (slot_map, complete) = db.rebuild_slot_map(&mphf, &keys);
            if !journal_present || !complete {
                // The journal cannot vouch for the dense→physical map, so
                // a perfect-mode label would be a lie: serve this handle
                // with hybrid semantics and let lookups probe.
                db.demoted_to_hybrid = true;
                warn!(
                    journal_present,
                    active_keys = keys.len(),
                    "slot map incomplete; serving perfect-mode store as hybrid"
                );
            }
            *db.active.write() = Some(Arc::new(ActiveMphf {
                mphf,
                slot_map: RwLock::new(slot_map),
            }));
        }
        Ok(db)
    }

    // ── accessors ────────────────────────────────────────────────────────────

    pub fn mode(&self) -> HashMode {
        let mode = HashMode::from_u32(self.slots.header().mode.load(Ordering::Acquire))
            .unwrap_or(HashMode::Standard);
        if mode == HashMode::Perfect && self.demoted_to_hybrid {
            HashMode::Hybrid
        } else {
            mode
        }
    }

    pub fn algorithm(&self) -> MphfKind {
        MphfKind::from_u32(self.slots.header().algorithm.load(Ordering::Acquire))
            .unwrap_or(MphfKind::None)
    }

    /// Monotonic change counter; bumped by every successful mutation.
    pub fn generation(&self) -> u64 {
        self.slots.header().generation.load(Ordering::Acquire)
    }

    pub fn slot_count(&self) -> u64 {
        self.slots.slot_count()
    }

    pub fn is_readonly(&self) -> bool {
        self.slots.is_readonly()
    }

    pub fn mphf_stats(&self) -> Option<MphfStats> {
        self.active_handle().map(|a| a.mphf.statistics())
    }

    pub fn journal_stats(&self) -> Option<JournalStats> {
        self.journal.as_ref().map(|j| j.stats())
    }

    #[inline]
    fn active_handle(&self) -> Option<Arc<ActiveMphf>> {
        self.active.read().clone()
    }

    #[inline]
    fn bump_generation(&self) {
        self.slots.header().generation.fetch_add(1, Ordering::Release);
    }

    // ── probe path ───────────────────────────────────────────────────────────

    fn probe_get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let hash = fnv1a32(key);
        for idx in probe_sequence(hash, self.slots.slot_count()) {
            match self.slots.read(idx) {
                Ok(Some((h, value))) if h == hash => return Some(value),
                Ok(Some(_)) => continue,
                _ => return None,
            }
        }
        None
    }

    /// Slot currently holding `key`'s hash, stopping at the first empty
    /// slot.
    fn probe_locate(&self, key: &[u8]) -> Option<u64> {
        let hash = fnv1a32(key);
        for idx in probe_sequence(hash, self.slots.slot_count()) {
            let h = self.slots.hash_at(idx);
            if h == 0 {
                return None;
            }
            if h == hash {
                return Some(idx);
            }
        }
        None
    }

    /// First slot that is empty or already carries `hash`.
    fn probe_claim(&self, hash: u32) -> Result<u64> {
        for idx in probe_sequence(hash, self.slots.slot_count()) {
            let h = self.slots.hash_at(idx);
            if h == 0 || h == hash {
                return Ok(idx);
            }
        }
        Err(KilatError::TableFull)
    }

    // ── core operations ──────────────────────────────────────────────────────

    /// Point lookup. Lock-free on the hot path; retries internally on
    /// torn-read detection.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mode = self.mode();
        if mode == HashMode::Standard {
            return self.probe_get(key);
        }
        let Some(active) = self.active_handle() else {
            return self.probe_get(key);
        };

        match active.mphf.slot_for(key) {
            Some(dense) => {
                let phys = active
                    .slot_map
                    .read()
                    .get(dense as usize)
                    .copied()
                    .unwrap_or(UNMAPPED);
                if phys == UNMAPPED {
                    // In perfect mode an unmapped dense index means the key
                    // was removed: definitive miss. Only hybrid probes.
                    return if mode == HashMode::Hybrid {
                        self.probe_get(key)
                    } else {
                        None
                    };
                }
                if let Ok(Some((h, value))) = self.slots.read(phys) {
                    if h == fnv1a32(key) {
                        return Some(value);
                    }
                }
                // Slot cleared by remove, or reused since the map was built.
                if mode == HashMode::Hybrid {
                    self.probe_get(key)
                } else {
                    None
                }
            }
            // An MPHF miss is definitive in pure perfect mode.
            None if mode == HashMode::Hybrid => self.probe_get(key),
            None => None,
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Insert or update. A new key while in perfect mode flips the store
    /// to hybrid rather than failing.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.slots.is_readonly() {
            return Err(KilatError::Readonly);
        }
        if value.len() > SLOT_DATA_SIZE {
            return Err(KilatError::ValueTooLarge(value.len()));
        }
        let hash = fnv1a32(key);

        let mode = self.mode();
        let idx = if mode == HashMode::Standard {
            self.probe_claim(hash)?
        } else {
            match self.active_handle() {
                Some(active) => match active.mphf.slot_for(key) {
                    Some(dense) => {
                        let phys = active
                            .slot_map
                            .read()
                            .get(dense as usize)
                            .copied()
                            .unwrap_or(UNMAPPED);
                        let usable = phys != UNMAPPED && {
                            let h = self.slots.hash_at(phys);
                            h == 0 || h == hash
                        };
                        if usable {
                            phys
                        } else {
                            // Stale or unknown mapping — re-probe and repair.
                            let idx = self.probe_claim(hash)?;
                            let mut map = active.slot_map.write();
                            if (dense as usize) < map.len() {
                                map[dense as usize] = idx;
                            }
                            idx
                        }
                    }
                    None => {
                        if mode == HashMode::Perfect {
                            self.slots
                                .header()
                                .mode
                                .store(HashMode::Hybrid.as_u32(), Ordering::Release);
                            debug!("new key after optimize; store is now hybrid");
                        }
                        self.probe_claim(hash)?
                    }
                },
                None => self.probe_claim(hash)?,
            }
        };

        self.slots.write(idx, hash, value)?;
        if let Some(journal) = &self.journal {
            journal.record_insert(key)?;
        }
        self.bump_generation();
        Ok(())
    }

    pub fn remove(&self, key: &[u8]) -> Result<()> {
        if self.slots.is_readonly() {
            return Err(KilatError::Readonly);
        }
        let hash = fnv1a32(key);

        let mode = self.mode();
        let idx = if mode == HashMode::Standard {
            self.probe_locate(key).ok_or(KilatError::KeyNotFound)?
        } else {
            match self.active_handle() {
                Some(active) => match active.mphf.slot_for(key) {
                    Some(dense) => {
                        let phys = active
                            .slot_map
                            .read()
                            .get(dense as usize)
                            .copied()
                            .unwrap_or(UNMAPPED);
                        if phys == UNMAPPED {
                            if mode != HashMode::Hybrid {
                                return Err(KilatError::KeyNotFound);
                            }
                            self.probe_locate(key).ok_or(KilatError::KeyNotFound)?
                        } else {
                            let h = self.slots.hash_at(phys);
                            if h == hash {
                                phys
                            } else if mode == HashMode::Hybrid && h != 0 {
                                self.probe_locate(key).ok_or(KilatError::KeyNotFound)?
                            } else {
                                return Err(KilatError::KeyNotFound);
                            }
                        }
                    }
                    None if mode == HashMode::Hybrid => {
                        self.probe_locate(key).ok_or(KilatError::KeyNotFound)?
                    }
                    None => return Err(KilatError::KeyNotFound),
                },
                None => self.probe_locate(key).ok_or(KilatError::KeyNotFound)?,
            }
        };

        self.slots.clear(idx)?;
        if let Some(journal) = &self.journal {
            journal.record_remove(key)?;
        }
        self.bump_generation();
        Ok(())
    }

    // ── batch operations ─────────────────────────────────────────────────────

    /// Parallel point lookups over the rayon pool.
    pub fn get_batch<K: AsRef<[u8]> + Sync>(&self, keys: &[K]) -> Vec<Option<Vec<u8>>> {
        keys.par_iter().map(|k| self.get(k.as_ref())).collect()
    }

    /// Sequential batch insert; returns how many succeeded.
    pub fn set_batch<K: AsRef<[u8]>, V: AsRef<[u8]>>(&self, pairs: &[(K, V)]) -> usize {
        pairs
            .iter()
            .filter(|(k, v)| self.set(k.as_ref(), v.as_ref()).is_ok())
            .count()
    }

    // ── stats ────────────────────────────────────────────────────────────────

    /// O(N): scans every slot to count occupancy.
    pub fn stats(&self) -> Stats {
        let total = self.slots.slot_count();
        let used = (0..total).filter(|&i| !self.slots.is_empty(i)).count() as u64;
        Stats {
            total_slots: total,
            used_slots: used,
            load_factor: used as f64 / total as f64,
            generation: self.generation(),
            mode: self.mode(),
            algorithm: self.algorithm(),
            perfect_hash_memory: self
                .active_handle()
                .map(|a| a.mphf.statistics().memory_bytes)
                .unwrap_or(0),
        }
    }

    // ── optimizer ────────────────────────────────────────────────────────────

    /// Build an MPHF over the journal's active key set, persist it, and
    /// flip the store to perfect mode. A failure leaves the prior mode and
    /// MPHF in place; an empty key set is a successful no-op.
    pub fn optimize(&self, config: &MphfConfig) -> Result<()> {
        if self.slots.is_readonly() {
            return Err(KilatError::Readonly);
        }
        let journal = self.journal.as_ref().ok_or(KilatError::Readonly)?;
        let keys = journal.active_keys();
        if keys.is_empty() {
            debug!("optimize with no active keys is a no-op");
            return Ok(());
        }

        let started = Instant::now();
        let mphf = Mphf::build(&keys, config)?;

        // Round-trip check: bijection onto [0, n).
        let n = keys.len() as u64;
        let mut seen = AHashSet::with_capacity(keys.len());
        for key in &keys {
            match mphf.slot_for(key) {
                Some(dense) if dense < n && seen.insert(dense) => {}
                _ => {
                    return Err(KilatError::OptimizationFailed(
                        "round-trip verification failed",
                    ))
                }
            }
        }

        let payload = mphf.serialize();
        let offset = self.slots.append_payload(&payload)?;
        let header = self.slots.header();
        header.mphf_offset.store(offset, Ordering::Release);
        header.mphf_size.store(payload.len() as u64, Ordering::Release);
        header.algorithm.store(mphf.kind().as_u32(), Ordering::Release);

        // Every key just passed the round-trip check and sits at its
        // probe-determined slot, so the map comes back complete.
        let (slot_map, _) = self.rebuild_slot_map(&mphf, &keys);
        let stats = mphf.statistics();
        // Publish the handle before the mode flip so any reader that
        // observes perfect mode finds it.
        *self.active.write() = Some(Arc::new(ActiveMphf {
            mphf,
            slot_map: RwLock::new(slot_map),
        }));
        header.mode.store(HashMode::Perfect.as_u32(), Ordering::Release);
        self.bump_generation();

        info!(
            keys = keys.len(),
            algorithm = ?config.kind,
            overflow = stats.overflow_count,
            payload_bytes = payload.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "store optimized to perfect mode"
        );
        Ok(())
    }

    /// Returns the dense→physical map plus whether every active key was
    /// accounted for. Dense indices of removed keys stay [`UNMAPPED`];
    /// those do not count against completeness.
    fn rebuild_slot_map(&self, mphf: &Mphf, keys: &[Vec<u8>]) -> (Vec<u64>, bool) {
        let mut map = vec![UNMAPPED; mphf.key_count() as usize];
        let mut complete = true;
        for key in keys {
            match (mphf.slot_for(key), self.probe_locate(key)) {
                (Some(dense), Some(phys)) => map[dense as usize] = phys,
                _ => complete = false,
            }
        }
        (map, complete)
    }

    // ── maintenance ──────────────────────────────────────────────────────────

    /// msync the slot region and fsync the journal.
    pub fn flush(&self) -> Result<()> {
        self.slots.flush()?;
        if let Some(journal) = &self.journal {
            journal.sync()?;
        }
        Ok(())
    }

    /// Rewrite the journal to only the active key set.
    pub fn compact_journal(&self) -> Result<()> {
        self.journal
            .as_ref()
            .ok_or(KilatError::Readonly)?
            .compact()
    }
}
