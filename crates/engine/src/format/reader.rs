//! Bounds-checked little-endian reader over a mapped model file
//!
//! Every read past the end of the buffer is a `LoadFailure` naming the field
//! being read, so truncated headers never panic.

use brainchat_common::{BrainChatError, Result};

/// Cursor over a byte slice
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Create a reader positioned at the start of `buf`
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current offset in bytes
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left after the current offset
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Borrow the next `len` bytes
    pub fn read_bytes(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(BrainChatError::load_failure(format!(
                "truncated file: {} needs {} bytes at offset {}, {} available",
                what,
                len,
                self.pos,
                self.remaining()
            )));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N, what)?);
        Ok(out)
    }

    pub fn read_u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.read_array::<1>(what)?[0])
    }

    pub fn read_i8(&mut self, what: &str) -> Result<i8> {
        Ok(i8::from_le_bytes(self.read_array(what)?))
    }

    pub fn read_u16(&mut self, what: &str) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array(what)?))
    }

    pub fn read_i16(&mut self, what: &str) -> Result<i16> {
        Ok(i16::from_le_bytes(self.read_array(what)?))
    }

    pub fn read_u32(&mut self, what: &str) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array(what)?))
    }

    pub fn read_i32(&mut self, what: &str) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array(what)?))
    }

    pub fn read_u64(&mut self, what: &str) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array(what)?))
    }

    pub fn read_i64(&mut self, what: &str) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array(what)?))
    }

    pub fn read_f32(&mut self, what: &str) -> Result<f32> {
        Ok(f32::from_le_bytes(self.read_array(what)?))
    }

    pub fn read_f64(&mut self, what: &str) -> Result<f64> {
        Ok(f64::from_le_bytes(self.read_array(what)?))
    }

    /// Read a `u64` count and check it against the bytes left
    ///
    /// `min_item_size` is the smallest encoding of one element; a count that
    /// cannot possibly fit is rejected before anything is allocated.
    pub fn read_count(&mut self, what: &str, min_item_size: usize) -> Result<usize> {
        let count = self.read_u64(what)?;
        self.check_count(count, what, min_item_size)
    }

    /// Validate a count read by the caller (see [`ByteReader::read_count`])
    pub fn check_count(&self, count: u64, what: &str, min_item_size: usize) -> Result<usize> {
        let count = usize::try_from(count)
            .map_err(|_| BrainChatError::load_failure(format!("{} {} is too large", what, count)))?;
        if count.saturating_mul(min_item_size.max(1)) > self.remaining() {
            return Err(BrainChatError::load_failure(format!(
                "{} {} exceeds the {} bytes left in the file",
                what,
                count,
                self.remaining()
            )));
        }
        Ok(count)
    }

    /// Read a UTF-8 string of `len` bytes
    pub fn read_str(&mut self, len: usize, what: &str) -> Result<String> {
        let bytes = self.read_bytes(len, what)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| BrainChatError::load_failure(format!("{} is not valid UTF-8", what)))
    }

    /// Skip to the next multiple of `alignment`
    pub fn align_to(&mut self, alignment: usize) -> Result<()> {
        let padding = (alignment - self.pos % alignment) % alignment;
        self.read_bytes(padding, "alignment padding").map(|_| ())
    }
}
