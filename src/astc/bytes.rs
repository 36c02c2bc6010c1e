//! Little-endian byte writer and reader shared by every binary format in the
//! crate (ASTC payloads, bytecode modules, RTME and PE containers).

use super::{DecodeError, EncodeError};

/// Growable output buffer. Capacity doubles whenever a write would overflow it.
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    fn grow_for(&mut self, extra: usize) {
        let needed = self.buf.len() + extra;
        if needed > self.buf.capacity() {
            let mut capacity = self.buf.capacity().max(64);
            while capacity < needed {
                capacity *= 2;
            }
            self.buf.reserve_exact(capacity - self.buf.len());
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.grow_for(1);
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(u8::from(v));
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.grow_for(bytes.len());
        self.buf.extend_from_slice(bytes);
    }

    /// Write a `u32` length or count, failing if it does not fit.
    pub fn write_len(&mut self, len: usize, what: &'static str) -> Result<(), EncodeError> {
        let len = u32::try_from(len).map_err(|_| EncodeError::TooLarge { what, len })?;
        self.write_u32(len);
        Ok(())
    }

    /// Length-prefixed UTF-8 string.
    pub fn write_str(&mut self, s: &str) -> Result<(), EncodeError> {
        self.write_len(s.len(), "string")?;
        self.write_bytes(s.as_bytes());
        Ok(())
    }

    pub fn write_opt<T>(
        &mut self,
        opt: Option<&T>,
        f: impl FnOnce(&mut Self, &T) -> Result<(), EncodeError>,
    ) -> Result<(), EncodeError> {
        match opt {
            None => {
                self.write_u8(0);
                Ok(())
            }
            Some(v) => {
                self.write_u8(1);
                f(self, v)
            }
        }
    }

    pub fn write_vec<T>(
        &mut self,
        items: &[T],
        what: &'static str,
        mut f: impl FnMut(&mut Self, &T) -> Result<(), EncodeError>,
    ) -> Result<(), EncodeError> {
        self.write_len(items.len(), what)?;
        for item in items {
            f(self, item)?;
        }
        Ok(())
    }

    /// Zero-fill up to `offset` (no-op if already past it).
    pub fn pad_to(&mut self, offset: usize) {
        if offset > self.buf.len() {
            let extra = offset - self.buf.len();
            self.grow_for(extra);
            self.buf.resize(offset, 0);
        }
    }

    /// Overwrite four bytes at `at` with a little-endian `u32`.
    pub fn patch_u32(&mut self, at: usize, v: u32) {
        self.buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }
}

/// Bounds-checked cursor over a byte slice.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Fail unless every byte has been consumed.
    pub fn expect_end(&self) -> Result<(), DecodeError> {
        if self.is_at_end() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes {
                count: self.remaining(),
            })
        }
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if n > self.remaining() {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: n,
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        let offset = self.pos;
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(DecodeError::UnknownTag {
                what: "boolean",
                tag,
                offset,
            }),
        }
    }

    /// Read a `u32` count and check it against the bytes left, so a corrupt
    /// count cannot trigger a huge allocation.
    pub fn read_len(&mut self, min_item_size: usize) -> Result<usize, DecodeError> {
        let offset = self.pos;
        let len = self.read_u32()? as usize;
        if len.saturating_mul(min_item_size.max(1)) > self.remaining() {
            return Err(DecodeError::Truncated {
                offset,
                needed: len,
            });
        }
        Ok(len)
    }

    pub fn read_str(&mut self) -> Result<String, DecodeError> {
        let len = self.read_len(1)?;
        let offset = self.pos;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8 { offset })
    }

    pub fn read_opt<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, DecodeError>,
    ) -> Result<Option<T>, DecodeError> {
        if self.read_bool()? {
            Ok(Some(f(self)?))
        } else {
            Ok(None)
        }
    }

    pub fn read_vec<T>(
        &mut self,
        min_item_size: usize,
        mut f: impl FnMut(&mut Self) -> Result<T, DecodeError>,
    ) -> Result<Vec<T>, DecodeError> {
        let count = self.read_len(min_item_size)?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(f(self)?);
        }
        Ok(items)
    }
}
