//! Little-endian wire primitives.
//!
//! Messages are field-concatenated with no framing; the transport
//! delimits them. All multi-byte scalars are little-endian, hashes are 32
//! raw bytes, signatures 64.

use kestrel_types::Hash;
use thiserror::Error;

/// Errors from decoding wire bytes.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("message truncated: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("field {field} has invalid value")]
    BadValue { field: &'static str },

    #[error("block rejected: {0}")]
    Entity(#[from] kestrel_types::EntityError),
}

/// Append-only encoder.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_i8(&mut self, v: i8) {
        self.buf.push(v as u8);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_hash(&mut self, h: &Hash) {
        self.buf.extend_from_slice(h.as_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor-based decoder.
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.data.len() - self.pos < n {
            return Err(WireError::Truncated {
                needed: n - (self.data.len() - self.pos),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_i8(&mut self) -> Result<i8, WireError> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn get_u16(&mut self) -> Result<u16, WireError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn get_hash(&mut self) -> Result<Hash, WireError> {
        let bytes = self.take(32)?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        Ok(Hash::from_bytes(arr))
    }

    pub fn get_sig_bytes(&mut self) -> Result<[u8; 64], WireError> {
        let bytes = self.take(64)?;
        let mut arr = [0u8; 64];
        arr.copy_from_slice(bytes);
        Ok(arr)
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<Vec<u8>, WireError> {
        Ok(self.take(n)?.to_vec())
    }

    /// How many bytes remain unread.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Fail if any input is left over.
    pub fn finish(self) -> Result<(), WireError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(WireError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_roundtrip() {
        let mut w = WireWriter::new();
        w.put_u8(7);
        w.put_u16(0xbeef);
        w.put_u32(0xdeadbeef);
        w.put_i8(-1);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.get_u8().unwrap(), 7);
        assert_eq!(r.get_u16().unwrap(), 0xbeef);
        assert_eq!(r.get_u32().unwrap(), 0xdeadbeef);
        assert_eq!(r.get_i8().unwrap(), -1);
        r.finish().unwrap();
    }

    #[test]
    fn test_little_endian_layout() {
        let mut w = WireWriter::new();
        w.put_u32(1);
        assert_eq!(w.into_bytes(), vec![1, 0, 0, 0]);
    }

    #[test]
    fn test_truncation_detected() {
        let mut r = WireReader::new(&[1, 2]);
        assert!(matches!(
            r.get_u32(),
            Err(WireError::Truncated { needed: 2 })
        ));
    }

    #[test]
    fn test_trailing_bytes_detected() {
        let r = WireReader::new(&[1]);
        assert!(matches!(r.finish(), Err(WireError::TrailingBytes(1))));
    }
}
