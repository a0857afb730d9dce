//! Little-endian wire helpers for the serialized MPHF payloads.
//!
//! Every payload opens with `magic(u32), format_version(u32),
//! algorithm_id(u32)`; arrays are length-prefixed with a u64 element
//! count. Any truncation or mismatch surfaces as `InvalidFormat`.

use crate::error::{KilatError, Result};
use crate::types::{MphfKind, STORE_MAGIC};

pub const MPHF_FORMAT_VERSION: u32 = 1;

pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new(kind: MphfKind) -> Self {
        let mut w = Self { buf: Vec::new() };
        w.put_u32(STORE_MAGIC);
        w.put_u32(MPHF_FORMAT_VERSION);
        w.put_u32(kind.as_u32());
        w
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    pub fn put_u32_slice(&mut self, vs: &[u32]) {
        self.put_u64(vs.len() as u64);
        for &v in vs {
            self.put_u32(v);
        }
    }

    pub fn put_u64_slice(&mut self, vs: &[u64]) {
        self.put_u64(vs.len() as u64);
        for &v in vs {
            self.put_u64(v);
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Validate the common framing and position the reader at the
    /// algorithm body.
    pub fn new(buf: &'a [u8], expect: MphfKind) -> Result<Self> {
        let mut r = Self { buf, pos: 0 };
        if r.get_u32()? != STORE_MAGIC {
            return Err(KilatError::InvalidFormat("bad payload magic"));
        }
        if r.get_u32()? != MPHF_FORMAT_VERSION {
            return Err(KilatError::InvalidFormat("unsupported payload version"));
        }
        if r.get_u32()? != expect.as_u32() {
            return Err(KilatError::InvalidFormat("algorithm id mismatch"));
        }
        Ok(r)
    }

    /// Read the algorithm id without consuming the framing — used to
    /// dispatch deserialization.
    pub fn peek_kind(buf: &[u8]) -> Result<MphfKind> {
        if buf.len() < 12 {
            return Err(KilatError::InvalidFormat("truncated payload"));
        }
        let id = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        MphfKind::from_u32(id)
            .filter(|k| *k != MphfKind::None)
            .ok_or(KilatError::InvalidFormat("unknown algorithm id"))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(KilatError::InvalidFormat("truncated payload"))?;
        if end > self.buf.len() {
            return Err(KilatError::InvalidFormat("truncated payload"));
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.get_u64()?))
    }

    pub fn get_u32_vec(&mut self) -> Result<Vec<u32>> {
        let len = self.get_u64()? as usize;
        if len.checked_mul(4).map_or(true, |b| b > self.buf.len() - self.pos) {
            return Err(KilatError::InvalidFormat("truncated array"));
        }
        (0..len).map(|_| self.get_u32()).collect()
    }

    pub fn get_u64_vec(&mut self) -> Result<Vec<u64>> {
        let len = self.get_u64()? as usize;
        if len.checked_mul(8).map_or(true, |b| b > self.buf.len() - self.pos) {
            return Err(KilatError::InvalidFormat("truncated array"));
        }
        (0..len).map(|_| self.get_u64()).collect()
    }

    /// Reject trailing bytes.
    pub fn expect_eof(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(KilatError::InvalidFormat("trailing bytes in payload"));
        }
        Ok(())
    }
}
