//! Big-endian binary codec for SSH wire data.
//!
//! [`Decoder`] is a cursor over a borrowed buffer. Every read checks the
//! remaining length first and fails with [`KestrelError::Protocol`] instead of
//! reading out of range. [`Encoder`] appends the same shapes to a `BytesMut`.
//!
//! Shapes supported in both directions:
//!
//! | shape | wire form |
//! |-------|-----------|
//! | `u8`, `bool` | 1 byte |
//! | `u16`, `u32`, `u64` | big-endian |
//! | fixed block | raw bytes |
//! | `u8_bytes` / `u16_bytes` / `u32_bytes` | 1/2/4-byte length prefix + bytes |
//! | `string` | `u32_bytes` holding UTF-8 |
//! | `name_list` | `string` of comma-separated names |
//! | `mpint` | `u32_bytes` holding a two's complement big-endian integer |
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::codec::{Decoder, Encoder};
//!
//! let mut enc = Encoder::new();
//! enc.u8(94).u32(7).u32_bytes(b"hi");
//! let bytes = enc.into_vec();
//!
//! let mut dec = Decoder::new(&bytes);
//! assert_eq!(dec.u8().unwrap(), 94);
//! assert_eq!(dec.u32().unwrap(), 7);
//! assert_eq!(dec.u32_bytes().unwrap(), b"hi");
//! dec.finish().unwrap();
//! ```

use bytes::{BufMut, BytesMut};
use kestrel_platform::{KestrelError, KestrelResult};

/// Cursor-based reader over a byte slice.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Decoder<'a> {
    /// Creates a decoder positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Current read offset.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Reads exactly `len` bytes.
    pub fn bytes(&mut self, len: usize) -> KestrelResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(KestrelError::Protocol(format!(
                "Cannot read {} bytes at offset {}: only {} remaining",
                len,
                self.offset,
                self.remaining()
            )));
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    /// Reads a fixed-size array.
    pub fn array<const N: usize>(&mut self) -> KestrelResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    /// Reads one byte.
    pub fn u8(&mut self) -> KestrelResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    /// Reads a boolean (any non-zero byte is `true`).
    pub fn bool(&mut self) -> KestrelResult<bool> {
        Ok(self.u8()? != 0)
    }

    /// Reads a big-endian `u16`.
    pub fn u16(&mut self) -> KestrelResult<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    /// Reads a big-endian `u32`.
    pub fn u32(&mut self) -> KestrelResult<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    /// Reads a big-endian `u64`.
    pub fn u64(&mut self) -> KestrelResult<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    /// Reads a block with a 1-byte length prefix.
    pub fn u8_bytes(&mut self) -> KestrelResult<&'a [u8]> {
        let len = self.u8()? as usize;
        self.bytes(len)
    }

    /// Reads a block with a 2-byte length prefix.
    pub fn u16_bytes(&mut self) -> KestrelResult<&'a [u8]> {
        let len = self.u16()? as usize;
        self.bytes(len)
    }

    /// Reads a block with a 4-byte length prefix.
    pub fn u32_bytes(&mut self) -> KestrelResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.bytes(len)
    }

    /// Reads a UTF-8 string with a 4-byte length prefix.
    pub fn string(&mut self) -> KestrelResult<&'a str> {
        let raw = self.u32_bytes()?;
        std::str::from_utf8(raw)
            .map_err(|_| KestrelError::Protocol("String contains invalid UTF-8".to_string()))
    }

    /// Reads a comma-separated name-list.
    pub fn name_list(&mut self) -> KestrelResult<Vec<String>> {
        let raw = self.string()?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        Ok(raw.split(',').map(str::to_string).collect())
    }

    /// Reads an mpint and returns its magnitude without sign padding.
    ///
    /// Negative values are rejected; SSH never sends them here.
    pub fn mpint(&mut self) -> KestrelResult<&'a [u8]> {
        let raw = self.u32_bytes()?;
        if raw.first().map_or(false, |b| b & 0x80 != 0) {
            return Err(KestrelError::Protocol("Negative mpint".to_string()));
        }
        let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
        Ok(&raw[start..])
    }

    /// Returns everything not yet read.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.offset..];
        self.offset = self.data.len();
        slice
    }

    /// Fails unless the whole input has been consumed.
    pub fn finish(&self) -> KestrelResult<()> {
        if self.remaining() != 0 {
            return Err(KestrelError::Protocol(format!(
                "{} trailing bytes after offset {}",
                self.remaining(),
                self.offset
            )));
        }
        Ok(())
    }
}

/// Growable big-endian writer.
///
/// All methods return `&mut Self` so writes can be chained.
#[derive(Debug, Clone, Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    /// Creates an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an encoder that starts with `reserved` zero bytes.
    pub fn with_reserved(reserved: usize) -> Self {
        let mut buf = BytesMut::with_capacity(reserved + 64);
        buf.put_bytes(0, reserved);
        Self { buf }
    }

    /// Appends one byte.
    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    /// Appends a boolean as 0 or 1.
    pub fn bool(&mut self, value: bool) -> &mut Self {
        self.u8(value as u8)
    }

    /// Appends a big-endian `u16`.
    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16(value);
        self
    }

    /// Appends a big-endian `u32`.
    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    /// Appends a big-endian `u64`.
    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64(value);
        self
    }

    /// Appends raw bytes without a prefix.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Appends bytes with a 1-byte length prefix.
    ///
    /// Blocks longer than 255 bytes are truncated to fit the prefix.
    pub fn u8_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        let len = bytes.len().min(u8::MAX as usize);
        self.u8(len as u8).raw(&bytes[..len])
    }

    /// Appends bytes with a 2-byte length prefix.
    ///
    /// Blocks longer than 65535 bytes are truncated to fit the prefix.
    pub fn u16_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        let len = bytes.len().min(u16::MAX as usize);
        self.u16(len as u16).raw(&bytes[..len])
    }

    /// Appends bytes with a 4-byte length prefix.
    pub fn u32_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.u32(bytes.len() as u32).raw(bytes)
    }

    /// Appends a string with a 4-byte length prefix.
    pub fn string(&mut self, value: &str) -> &mut Self {
        self.u32_bytes(value.as_bytes())
    }

    /// Appends a comma-separated name-list.
    pub fn name_list<S: AsRef<str>>(&mut self, names: &[S]) -> &mut Self {
        let joined = names
            .iter()
            .map(|s| s.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.string(&joined)
    }

    /// Appends an unsigned big-endian magnitude as an mpint.
    pub fn mpint(&mut self, magnitude: &[u8]) -> &mut Self {
        let start = magnitude
            .iter()
            .position(|&b| b != 0)
            .unwrap_or(magnitude.len());
        let trimmed = &magnitude[start..];
        if trimmed.first().map_or(false, |b| b & 0x80 != 0) {
            self.u32(trimmed.len() as u32 + 1).u8(0).raw(trimmed)
        } else {
            self.u32_bytes(trimmed)
        }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Mutable access to the written bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[..]
    }

    /// Consumes the encoder, returning its buffer.
    pub fn into_inner(self) -> BytesMut {
        self.buf
    }

    /// Consumes the encoder, returning a `Vec<u8>`.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

impl AsRef<[u8]> for Encoder {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_round_trip() {
        let mut enc = Encoder::new();
        enc.u8(0xAB)
            .bool(true)
            .u16(0x1234)
            .u32(0xDEAD_BEEF)
            .u64(u64::MAX - 1)
            .raw(&[1, 2, 3]);
        let bytes = enc.into_vec();
        assert_eq!(bytes.len(), 1 + 1 + 2 + 4 + 8 + 3);

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.u8().unwrap(), 0xAB);
        assert!(dec.bool().unwrap());
        assert_eq!(dec.u16().unwrap(), 0x1234);
        assert_eq!(dec.u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(dec.u64().unwrap(), u64::MAX - 1);
        assert_eq!(dec.bytes(3).unwrap(), &[1, 2, 3]);
        assert!(dec.finish().is_ok());
    }

    #[test]
    fn test_length_prefixed_shapes() {
        let mut enc = Encoder::new();
        enc.u8_bytes(b"a").u16_bytes(b"bc").u32_bytes(b"def").string("ssh-rsa");
        let bytes = enc.into_vec();
        assert_eq!(&bytes[..2], &[1, b'a']);
        assert_eq!(&bytes[2..6], &[0, 2, b'b', b'c']);

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.u8_bytes().unwrap(), b"a");
        assert_eq!(dec.u16_bytes().unwrap(), b"bc");
        assert_eq!(dec.u32_bytes().unwrap(), b"def");
        assert_eq!(dec.string().unwrap(), "ssh-rsa");
        dec.finish().unwrap();
    }

    #[test]
    fn test_bounds_error_does_not_advance() {
        // Length prefix claims 10 bytes, only 2 follow
        let data = [0, 0, 0, 10, 1, 2];
        let mut dec = Decoder::new(&data);
        let result = dec.u32_bytes();
        assert!(matches!(result, Err(KestrelError::Protocol(_))));

        let mut dec = Decoder::new(&[1, 2, 3]);
        assert!(dec.u32().is_err());
        assert_eq!(dec.offset(), 0);
        assert_eq!(dec.remaining(), 3);
    }

    #[test]
    fn test_finish_rejects_trailing_bytes() {
        let data = [0u8, 1, 2];
        let mut dec = Decoder::new(&data);
        dec.u8().unwrap();
        assert!(matches!(dec.finish(), Err(KestrelError::Protocol(_))));
        dec.rest();
        assert!(dec.finish().is_ok());
    }

    #[test]
    fn test_invalid_utf8_string() {
        let mut enc = Encoder::new();
        enc.u32_bytes(&[0xFF, 0xFE]);
        let bytes = enc.into_vec();
        assert!(Decoder::new(&bytes).string().is_err());
    }

    #[test]
    fn test_name_list() {
        let mut enc = Encoder::new();
        enc.name_list(&["aes128-ctr", "aes128-cbc"]).name_list::<&str>(&[]);
        let bytes = enc.into_vec();

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.name_list().unwrap(), vec!["aes128-ctr", "aes128-cbc"]);
        assert!(dec.name_list().unwrap().is_empty());
    }

    #[test]
    fn test_mpint_encoding() {
        // RFC 4251 Section 5 examples
        let mut enc = Encoder::new();
        enc.mpint(&[]);
        assert_eq!(enc.as_ref(), &[0, 0, 0, 0]);

        let mut enc = Encoder::new();
        enc.mpint(&[0x00, 0x80]);
        assert_eq!(enc.as_ref(), &[0, 0, 0, 2, 0x00, 0x80]);

        let mut enc = Encoder::new();
        enc.mpint(&[0x09, 0xa3, 0x78, 0xf9, 0xb2, 0xe3, 0x32, 0xa7]);
        assert_eq!(
            enc.as_ref(),
            &[0, 0, 0, 8, 0x09, 0xa3, 0x78, 0xf9, 0xb2, 0xe3, 0x32, 0xa7]
        );

        let bytes = enc.into_vec();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(
            dec.mpint().unwrap(),
            &[0x09, 0xa3, 0x78, 0xf9, 0xb2, 0xe3, 0x32, 0xa7]
        );
    }

    #[test]
    fn test_mpint_decode_strips_sign_byte() {
        let data = [0, 0, 0, 2, 0x00, 0x80];
        assert_eq!(Decoder::new(&data).mpint().unwrap(), &[0x80]);

        let negative = [0, 0, 0, 1, 0xFF];
        assert!(Decoder::new(&negative).mpint().is_err());
    }

    #[test]
    fn test_with_reserved() {
        let mut enc = Encoder::with_reserved(5);
        enc.u8(94);
        assert_eq!(enc.as_ref(), &[0, 0, 0, 0, 0, 94]);
        enc.as_mut_slice()[0] = 1;
        assert_eq!(enc.as_ref()[0], 1);
    }
}
