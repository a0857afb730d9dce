//! SlotStore — the fixed slot array backed by a memory-mapped file.
//!
//! Single writer, many lock-free readers. Every slot write walks the
//! versioned protocol: publish an odd version (write in progress), copy
//! size + data, publish the next even version. Readers accept a slot only
//! when the same even `hash_version` is observed on both sides of the
//! copy, retrying a bounded number of times before treating the slot as
//! absent for this cycle.
//!
//! The serialized MPHF payload is appended through plain file I/O, never
//! through the mapping, so concurrent readers of the slot region are
//! undisturbed by optimization.

use crate::error::{KilatError, Result};
use crate::types::{
    pack_hash_version, split_hash_version, Slot, StoreHeader, FORMAT_VERSION, HEADER_SIZE,
    SLOT_DATA_SIZE, SLOT_SIZE, STORE_MAGIC,
};
use memmap2::{Mmap, MmapMut};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::Ordering;

/// Attempts before a reader gives up on a slot under writer churn.
const READ_RETRIES: usize = 16;

const SLOT_DATA_OFFSET: usize = std::mem::offset_of!(Slot, data);

enum MapRegion {
    Rw(MmapMut),
    Ro(Mmap),
}

impl MapRegion {
    #[inline]
    fn as_ptr(&self) -> *const u8 {
        match self {
            MapRegion::Rw(m) => m.as_ptr(),
            MapRegion::Ro(m) => m.as_ptr(),
        }
    }
}

pub struct SlotStore {
    map: MapRegion,
    file: File,
    total_slots: u64,
    readonly: bool,
}

impl SlotStore {
    /// Create a fresh store of `total_slots` slots, truncating any
    /// existing file at `path`.
    pub fn create(path: &Path, total_slots: u64) -> Result<Self> {
        if total_slots == 0 {
            return Err(KilatError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "slot count must be non-zero",
            )));
        }
        let file_size = HEADER_SIZE as u64 + total_slots * SLOT_SIZE as u64;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(file_size)?;

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let header_ptr = mmap.as_ptr() as *mut StoreHeader;
        unsafe {
            (*header_ptr).magic = STORE_MAGIC;
            (*header_ptr).format_version = FORMAT_VERSION;
            (*header_ptr).total_slots = total_slots;
            (*header_ptr).generation.store(0, Ordering::Release);
            (*header_ptr).mode.store(0, Ordering::Release);
            (*header_ptr).algorithm.store(0, Ordering::Release);
            (*header_ptr).mphf_offset.store(0, Ordering::Release);
            (*header_ptr).mphf_size.store(0, Ordering::Release);
        }

        Ok(Self {
            map: MapRegion::Rw(mmap),
            file,
            total_slots,
            readonly: false,
        })
    }

    /// Open an existing store, validating magic, format version and size.
    pub fn open(path: &Path, readonly: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < HEADER_SIZE as u64 {
            return Err(KilatError::InvalidFormat("truncated header"));
        }

        let map = if readonly {
            MapRegion::Ro(unsafe { Mmap::map(&file)? })
        } else {
            MapRegion::Rw(unsafe { MmapMut::map_mut(&file)? })
        };

        let header = unsafe { &*(map.as_ptr() as *const StoreHeader) };
        if header.magic != STORE_MAGIC {
            return Err(KilatError::InvalidFormat("bad magic"));
        }
        if header.format_version != FORMAT_VERSION {
            return Err(KilatError::InvalidFormat("unsupported format version"));
        }
        let total_slots = header.total_slots;
        if total_slots == 0
            || file_len < HEADER_SIZE as u64 + total_slots * SLOT_SIZE as u64
        {
            return Err(KilatError::InvalidFormat("truncated slot region"));
        }

        Ok(Self {
            map,
            file,
            total_slots,
            readonly,
        })
    }

    #[inline]
    pub fn header(&self) -> &StoreHeader {
        unsafe { &*(self.map.as_ptr() as *const StoreHeader) }
    }

    #[inline]
    pub fn slot_count(&self) -> u64 {
        self.total_slots
    }

    #[inline]
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    // ── slot access ──────────────────────────────────────────────────────────

    #[inline]
    fn slot_offset(idx: u64) -> usize {
        HEADER_SIZE + idx as usize * SLOT_SIZE
    }

    #[inline]
    fn slot(&self, idx: u64) -> &Slot {
        unsafe { &*(self.map.as_ptr().add(Self::slot_offset(idx)) as *const Slot) }
    }

    #[inline]
    fn check_bounds(&self, idx: u64) -> Result<()> {
        if idx >= self.total_slots {
            return Err(KilatError::OutOfBounds(idx));
        }
        Ok(())
    }

    /// Read slot `idx`. `Ok(None)` means empty — or unreadable this cycle
    /// under sustained writer churn.
    pub fn read(&self, idx: u64) -> Result<Option<(u32, Vec<u8>)>> {
        self.check_bounds(idx)?;
        let slot = self.slot(idx);
        let data_ptr = unsafe {
            self.map
                .as_ptr()
                .add(Self::slot_offset(idx) + SLOT_DATA_OFFSET)
        };

        for _ in 0..READ_RETRIES {
            let hv = slot.hash_version.load(Ordering::Acquire);
            let (hash, version) = split_hash_version(hv);
            if hash == 0 {
                return Ok(None);
            }
            if version & 1 == 1 {
                // Write in progress.
                std::hint::spin_loop();
                continue;
            }

            let size = slot.size.load(Ordering::Relaxed) as usize;
            if size > SLOT_DATA_SIZE {
                continue;
            }
            let mut buf = vec![0u8; size];
            unsafe {
                std::ptr::copy_nonoverlapping(data_ptr, buf.as_mut_ptr(), size);
            }

            if slot.hash_version.load(Ordering::Acquire) == hv {
                return Ok(Some((hash, buf)));
            }
        }
        Ok(None)
    }

    /// Write `(hash, bytes)` into slot `idx`. Oversize payloads leave the
    /// slot untouched.
    pub fn write(&self, idx: u64, hash: u32, bytes: &[u8]) -> Result<()> {
        if self.readonly {
            return Err(KilatError::Readonly);
        }
        self.check_bounds(idx)?;
        if bytes.len() > SLOT_DATA_SIZE {
            return Err(KilatError::ValueTooLarge(bytes.len()));
        }
        debug_assert_ne!(hash, 0, "hash 0 is the empty sentinel");

        let slot = self.slot(idx);
        let (_, version) = split_hash_version(slot.hash_version.load(Ordering::Relaxed));

        // Odd version: readers treat the slot as in-flight.
        slot.hash_version
            .store(pack_hash_version(hash, version.wrapping_add(1)), Ordering::Release);
        slot.size.store(bytes.len() as u32, Ordering::Relaxed);
        unsafe {
            let dest = self
                .map
                .as_ptr()
                .add(Self::slot_offset(idx) + SLOT_DATA_OFFSET) as *mut u8;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dest, bytes.len());
        }
        // Even version: commit.
        slot.hash_version
            .store(pack_hash_version(hash, version.wrapping_add(2)), Ordering::Release);
        Ok(())
    }

    /// Zero the hash and bump the version by 2. Data bytes are left stale.
    pub fn clear(&self, idx: u64) -> Result<()> {
        if self.readonly {
            return Err(KilatError::Readonly);
        }
        self.check_bounds(idx)?;
        let slot = self.slot(idx);
        let (_, version) = split_hash_version(slot.hash_version.load(Ordering::Relaxed));
        slot.hash_version
            .store(pack_hash_version(0, version.wrapping_add(2)), Ordering::Release);
        Ok(())
    }

    #[inline]
    pub fn hash_at(&self, idx: u64) -> u32 {
        split_hash_version(self.slot(idx).hash_version.load(Ordering::Acquire)).0
    }

    #[inline]
    pub fn is_empty(&self, idx: u64) -> bool {
        self.hash_at(idx) == 0
    }

    // ── MPHF payload region ──────────────────────────────────────────────────

    /// Append a serialized payload (plus crc32 trailer) past the slot
    /// region and return its file offset.
    pub fn append_payload(&self, payload: &[u8]) -> Result<u64> {
        if self.readonly {
            return Err(KilatError::Readonly);
        }
        let mut f = &self.file;
        let offset = f.seek(SeekFrom::End(0))?;
        f.write_all(payload)?;
        f.write_all(&crc32fast::hash(payload).to_le_bytes())?;
        f.sync_data()?;
        Ok(offset)
    }

    /// Read back a payload written by [`append_payload`], verifying the
    /// crc32 trailer.
    pub fn read_payload(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        let file_len = self.file.metadata()?.len();
        let end = offset.checked_add(size).and_then(|e| e.checked_add(4));
        match end {
            Some(e) if size != 0 && e <= file_len => {}
            _ => return Err(KilatError::InvalidFormat("truncated perfect-hash payload")),
        }
        let mut f = &self.file;
        f.seek(SeekFrom::Start(offset))?;
        let mut payload = vec![0u8; size as usize];
        f.read_exact(&mut payload)?;
        let mut crc = [0u8; 4];
        f.read_exact(&mut crc)?;
        if u32::from_le_bytes(crc) != crc32fast::hash(&payload) {
            return Err(KilatError::InvalidFormat("perfect-hash payload checksum mismatch"));
        }
        Ok(payload)
    }

    /// Flush the slot region to the OS.
    pub fn flush(&self) -> Result<()> {
        if let MapRegion::Rw(m) = &self.map {
            m.flush()?;
        }
        Ok(())
    }
}
