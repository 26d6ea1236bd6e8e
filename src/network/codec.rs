//! Typed read/write primitives for frame bodies.
//!
//! All integers are big-endian. Booleans are a single sentinel byte (0 or 1).
//! Short strings carry a u16 length prefix, long strings and structured
//! values a u32 prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Truncated field: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Illegal boolean byte {0:#04x}")]
    IllegalByte(u8),

    #[error("String too large: {len} bytes (max {max})")]
    StringTooLarge { len: usize, max: usize },

    #[error("String field is not valid UTF-8")]
    InvalidUtf8(Bytes),

    /// The block was read completely; `raw` holds every byte of it.
    #[error("Structured value failed to parse: {source}")]
    Json {
        raw: Bytes,
        #[source]
        source: serde_json::Error,
    },

    #[error("Structured value failed to encode: {0}")]
    Encode(serde_json::Error),

    #[error("Unknown frame kind {0}")]
    UnknownFrameKind(u8),

    #[error("Frame body too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Transport errors leave the byte stream in an unknown state; every
    /// other variant is reported after the offending frame was consumed.
    pub fn is_transport(&self) -> bool {
        matches!(self, CodecError::Io(_))
    }

    /// Raw bytes preserved by a failed decode, if any.
    pub fn raw(&self) -> Option<&Bytes> {
        match self {
            CodecError::Json { raw, .. } | CodecError::InvalidUtf8(raw) => Some(raw),
            _ => None,
        }
    }
}

/// Builds one buffer that is written to the wire in a single call.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(256) }
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32(v);
        self
    }

    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.buf.put_i64(v);
        self
    }

    pub fn put_bool(&mut self, v: bool) -> &mut Self {
        self.buf.put_u8(v as u8);
        self
    }

    /// u16-prefixed string. Nothing is written when `s` exceeds `max`.
    pub fn put_short_str(&mut self, s: &str, max: usize) -> Result<&mut Self, CodecError> {
        let limit = max.min(u16::MAX as usize);
        if s.len() > limit {
            return Err(CodecError::StringTooLarge { len: s.len(), max: limit });
        }
        self.buf.put_u16(s.len() as u16);
        self.buf.put_slice(s.as_bytes());
        Ok(self)
    }

    pub fn put_long_str(&mut self, s: &str) -> Result<&mut Self, CodecError> {
        self.put_long_bytes(s.as_bytes())
    }

    pub fn put_long_bytes(&mut self, b: &[u8]) -> Result<&mut Self, CodecError> {
        if b.len() > u32::MAX as usize {
            return Err(CodecError::StringTooLarge { len: b.len(), max: u32::MAX as usize });
        }
        self.buf.put_u32(b.len() as u32);
        self.buf.put_slice(b);
        Ok(self)
    }

    /// Compact JSON inside a u32-prefixed block.
    pub fn put_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<&mut Self, CodecError> {
        let encoded = serde_json::to_vec(value).map_err(CodecError::Encode)?;
        self.put_long_bytes(&encoded)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Cursor over a received buffer.
#[derive(Debug, Clone)]
pub struct PacketReader {
    buf: Bytes,
}

impl PacketReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < n {
            return Err(CodecError::Truncated { needed: n, available: self.buf.remaining() });
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u16(&mut self) -> Result<u16, CodecError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn get_i32(&mut self) -> Result<i32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn get_i64(&mut self) -> Result<i64, CodecError> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn get_bool(&mut self) -> Result<bool, CodecError> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::IllegalByte(other)),
        }
    }

    /// Reads a u16-prefixed string. An oversized string is skipped before
    /// the error is returned so the following field stays aligned.
    pub fn get_short_str(&mut self, max: usize) -> Result<String, CodecError> {
        let len = self.get_u16()? as usize;
        let block = self.take(len)?;
        if len > max {
            return Err(CodecError::StringTooLarge { len, max });
        }
        into_string(block)
    }

    pub fn get_long_str(&mut self) -> Result<String, CodecError> {
        let block = self.get_long_bytes()?;
        into_string(block)
    }

    pub fn get_long_bytes(&mut self) -> Result<Bytes, CodecError> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    /// Reads a u32-prefixed JSON block. On a parse failure the whole block
    /// comes back inside [`CodecError::Json`].
    pub fn get_json<T: DeserializeOwned>(&mut self) -> Result<T, CodecError> {
        let raw = self.get_long_bytes()?;
        parse_json(raw)
    }

    fn take(&mut self, len: usize) -> Result<Bytes, CodecError> {
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }
}

fn into_string(block: Bytes) -> Result<String, CodecError> {
    match std::str::from_utf8(&block) {
        Ok(s) => Ok(s.to_string()),
        Err(_) => Err(CodecError::InvalidUtf8(block)),
    }
}

pub fn parse_json<T: DeserializeOwned>(raw: Bytes) -> Result<T, CodecError> {
    serde_json::from_slice(&raw).map_err(|source| CodecError::Json { raw, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reader(w: PacketWriter) -> PacketReader {
        PacketReader::new(w.into_bytes())
    }

    #[test]
    fn test_integers_big_endian() {
        let mut w = PacketWriter::new();
        w.put_u16(0x1234).put_u32(0xDEADBEEF).put_i32(-5).put_i64(-1);
        let bytes = w.into_bytes();
        assert_eq!(&bytes[..2], &[0x12, 0x34]);

        let mut r = PacketReader::new(bytes);
        assert_eq!(r.get_u16().unwrap(), 0x1234);
        assert_eq!(r.get_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(r.get_i32().unwrap(), -5);
        assert_eq!(r.get_i64().unwrap(), -1);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_bool_round_trip_and_illegal_byte() {
        let mut w = PacketWriter::new();
        w.put_bool(true).put_bool(false).put_u8(0x02);
        let mut r = reader(w);
        assert!(r.get_bool().unwrap());
        assert!(!r.get_bool().unwrap());
        assert!(matches!(r.get_bool(), Err(CodecError::IllegalByte(0x02))));
    }

    #[test]
    fn test_short_string_round_trip() {
        for s in ["", "hello", "héllo wörld ✓", "日本語"] {
            let mut w = PacketWriter::new();
            w.put_short_str(s, 64).unwrap();
            assert_eq!(reader(w).get_short_str(64).unwrap(), s);
        }
    }

    #[test]
    fn test_short_string_too_large_on_write_writes_nothing() {
        let mut w = PacketWriter::new();
        let err = w.put_short_str("abcdef", 3).unwrap_err();
        assert!(matches!(err, CodecError::StringTooLarge { len: 6, max: 3 }));
        assert!(w.is_empty());
    }

    #[test]
    fn test_short_string_too_large_on_read_keeps_alignment() {
        let mut w = PacketWriter::new();
        w.put_short_str("much too long", 100).unwrap();
        w.put_short_str("next", 100).unwrap();
        let mut r = reader(w);

        assert!(matches!(r.get_short_str(4), Err(CodecError::StringTooLarge { len: 13, max: 4 })));
        assert_eq!(r.get_short_str(4).unwrap(), "next");
    }

    #[test]
    fn test_long_string_round_trip() {
        let s = "x".repeat(70_000);
        let mut w = PacketWriter::new();
        w.put_long_str(&s).unwrap();
        assert_eq!(reader(w).get_long_str().unwrap(), s);
    }

    #[test]
    fn test_truncated_field() {
        let mut r = PacketReader::new(Bytes::from_static(&[0x00]));
        assert!(matches!(r.get_u32(), Err(CodecError::Truncated { needed: 4, available: 1 })));
    }

    #[test]
    fn test_json_parse_failure_preserves_raw_block() {
        let mut w = PacketWriter::new();
        w.put_long_bytes(b"not { json").unwrap();
        w.put_json(&json!({"ok": true})).unwrap();
        let mut r = reader(w);

        let err = r.get_json::<serde_json::Value>().unwrap_err();
        assert_eq!(err.raw().map(|b| &b[..]), Some(&b"not { json"[..]));
        assert!(!err.is_transport());

        let next: serde_json::Value = r.get_json().unwrap();
        assert_eq!(next, json!({"ok": true}));
    }

    #[test]
    fn test_json_is_compact() {
        let mut w = PacketWriter::new();
        w.put_json(&json!({"a": 1, "b": [1, 2]})).unwrap();
        let mut r = reader(w);
        let raw = r.get_long_bytes().unwrap();
        assert_eq!(&raw[..], br#"{"a":1,"b":[1,2]}"#);
    }
}
