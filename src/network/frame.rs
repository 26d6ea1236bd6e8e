//! Wire frames.
//!
//! Layout: `kind:u8 | tag_len:u16 | tag | body_len:u32 | body`, where the
//! body is one compact JSON document. A frame is always consumed from the
//! socket in full before it is validated, so a bad frame never shifts the
//! position of the next one.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::codec::{parse_json, CodecError, PacketReader, PacketWriter};

/// Longest accepted type tag.
pub const MAX_TAG_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Request = 0,
    Response = 1,
    Error = 2,
    Event = 3,
}

impl FrameKind {
    pub fn from_u8(v: u8) -> Result<Self, CodecError> {
        match v {
            0 => Ok(FrameKind::Request),
            1 => Ok(FrameKind::Response),
            2 => Ok(FrameKind::Error),
            3 => Ok(FrameKind::Event),
            other => Err(CodecError::UnknownFrameKind(other)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub max_tag_len: usize,
    pub max_body_len: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self { max_tag_len: MAX_TAG_LEN, max_body_len: 1024 * 1024 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub tag: String,
    pub body: Bytes,
}

/// Body of a [`FrameKind::Error`] frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl Frame {
    pub fn new<T: Serialize + ?Sized>(kind: FrameKind, tag: &str, body: &T) -> Result<Self, CodecError> {
        let body = serde_json::to_vec(body).map_err(CodecError::Encode)?;
        Ok(Self { kind, tag: tag.to_string(), body: Bytes::from(body) })
    }

    pub fn request<T: Serialize + ?Sized>(tag: &str, body: &T) -> Result<Self, CodecError> {
        Self::new(FrameKind::Request, tag, body)
    }

    pub fn response<T: Serialize + ?Sized>(tag: &str, body: &T) -> Result<Self, CodecError> {
        Self::new(FrameKind::Response, tag, body)
    }

    pub fn error(tag: &str, body: &ErrorBody) -> Result<Self, CodecError> {
        Self::new(FrameKind::Error, tag, body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        parse_json(self.body.clone())
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut w = PacketWriter::new();
        w.put_u8(self.kind as u8);
        w.put_short_str(&self.tag, MAX_TAG_LEN)?;
        w.put_long_bytes(&self.body)?;
        Ok(w.into_bytes())
    }

    /// Decodes one frame from an in-memory buffer.
    pub fn decode(buf: Bytes, limits: FrameLimits) -> Result<Self, CodecError> {
        let mut r = PacketReader::new(buf);
        let kind = r.get_u8()?;
        let tag = r.get_short_str(limits.max_tag_len)?;
        let body = r.get_long_bytes()?;
        if body.len() > limits.max_body_len {
            return Err(CodecError::FrameTooLarge { len: body.len(), max: limits.max_body_len });
        }
        Ok(Self { kind: FrameKind::from_u8(kind)?, tag, body })
    }
}

/// Reads exactly one frame from `reader`.
///
/// Only [`CodecError::Io`] means the stream position is lost. Oversized
/// bodies are drained, and tag or kind problems are reported after the
/// whole frame has been read.
pub async fn read_frame<R>(reader: &mut R, limits: FrameLimits) -> Result<Frame, CodecError>
where
    R: AsyncRead + Unpin,
{
    let kind = reader.read_u8().await?;

    let tag_len = reader.read_u16().await? as usize;
    let mut tag = vec![0u8; tag_len];
    reader.read_exact(&mut tag).await?;

    let body_len = reader.read_u32().await? as usize;
    if body_len > limits.max_body_len {
        let drained = tokio::io::copy(&mut (&mut *reader).take(body_len as u64), &mut tokio::io::sink()).await?;
        if drained < body_len as u64 {
            return Err(CodecError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        return Err(CodecError::FrameTooLarge { len: body_len, max: limits.max_body_len });
    }
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;

    let kind = FrameKind::from_u8(kind)?;
    if tag_len > limits.max_tag_len {
        return Err(CodecError::StringTooLarge { len: tag_len, max: limits.max_tag_len });
    }
    let tag = String::from_utf8(tag).map_err(|e| CodecError::InvalidUtf8(Bytes::from(e.into_bytes())))?;

    Ok(Frame { kind, tag, body: Bytes::from(body) })
}
