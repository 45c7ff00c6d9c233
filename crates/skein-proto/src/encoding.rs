//! Little-endian packing of the values carried inside payloads.
//!
//! # Encoding Rules
//!
//! - **Integers**: Little-endian encoding
//! - **Strings**: u32 byte length followed by UTF-8 bytes
//! - **Maps**: u32 count followed by key/value pairs

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Errors while unpacking a payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough bytes to decode
    #[error("truncated message: expected {expected}, got {available}")]
    TooSmall {
        /// Expected number of bytes
        expected: usize,
        /// Actually available bytes
        available: usize,
    },

    /// A count or length exceeds its limit
    #[error("message size is too large: {0}")]
    TooLarge(usize),

    /// Invalid UTF-8 string
    #[error("invalid UTF-8 string: {0}")]
    InvalidUtf8(String),

    /// Custom decode error
    #[error("{0}")]
    Custom(String),
}

/// Values that can be packed into a payload.
pub trait WireEncode {
    /// Appends the packed value to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Returns the packed value.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Values that can be unpacked from a payload.
pub trait WireDecode: Sized {
    /// Unpacks a value, advancing `buf` past it.
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError>;

    /// Unpacks a value from a byte slice.
    fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = Bytes::copy_from_slice(bytes);
        Self::decode(&mut buf)
    }
}

fn need(buf: &Bytes, n: usize) -> Result<(), DecodeError> {
    if buf.remaining() < n {
        return Err(DecodeError::TooSmall {
            expected: n,
            available: buf.remaining(),
        });
    }
    Ok(())
}

impl WireEncode for u32 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(*self);
    }
}

impl WireDecode for u32 {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 4)?;
        Ok(buf.get_u32_le())
    }
}

impl WireEncode for str {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len() as u32);
        buf.put_slice(self.as_bytes());
    }
}

impl WireEncode for String {
    fn encode(&self, buf: &mut BytesMut) {
        self.as_str().encode(buf);
    }
}

impl WireDecode for String {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let len = u32::decode(buf)? as usize;
        need(buf, len)?;
        let raw = buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|e| DecodeError::InvalidUtf8(e.to_string()))
    }
}

impl WireEncode for BTreeMap<String, String> {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len() as u32);
        for (k, v) in self {
            k.encode(buf);
            v.encode(buf);
        }
    }
}

/// Largest number of attributes accepted in a packed map.
pub const MAX_MAP_LEN: usize = 1024;

impl WireDecode for BTreeMap<String, String> {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let n = u32::decode(buf)? as usize;
        if n > MAX_MAP_LEN {
            return Err(DecodeError::TooLarge(n));
        }
        let mut map = BTreeMap::new();
        for _ in 0..n {
            let k = String::decode(buf)?;
            let v = String::decode(buf)?;
            map.insert(k, v);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_layout() {
        let b = "abc".to_string().to_bytes();
        assert_eq!(&b[..], &[3, 0, 0, 0, b'a', b'b', b'c']);
        assert_eq!(String::from_bytes(&b).unwrap(), "abc");
    }

    #[test]
    fn test_truncated_string() {
        let err = String::from_bytes(&[5, 0, 0, 0, b'a']).unwrap_err();
        assert_eq!(
            err,
            DecodeError::TooSmall {
                expected: 5,
                available: 1
            }
        );
    }

    #[test]
    fn test_map_too_large() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(5000);
        let err = BTreeMap::<String, String>::from_bytes(&buf).unwrap_err();
        assert_eq!(err, DecodeError::TooLarge(5000));
    }

    #[test]
    fn test_invalid_utf8() {
        let err = String::from_bytes(&[2, 0, 0, 0, 0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidUtf8(_)));
    }
}
