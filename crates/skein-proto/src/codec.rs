//! Frame encoding and decoding.
//!
//! Wire layout, little-endian: `size:u32 tag:u32 kind:u16 payload[size]`.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use skein_core::{StreamError, KIB};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::dir::{Addr, Dir};
use crate::encoding::{DecodeError, WireDecode, WireEncode};
use crate::msg::{kind, Msg};

/// Size of a frame header.
pub const HEADER_SIZE: usize = 4 + 4 + 2;

/// Default maximum payload size.
pub const MAX_MSG_SIZE: usize = 64 * KIB;

/// Chunk size used when turning byte streams into messages.
pub const MSG_SIZE: usize = 16 * KIB;

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Payload exceeds the configured maximum
    #[error("message size is too large: {0}")]
    TooLarge(usize),

    /// The message has nothing that can be written
    #[error("msg write discarded")]
    Discarded,

    /// A kind was defined twice
    #[error("type already defined: {0}")]
    AlreadyDefined(u16),

    /// IO error
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The queue on the other side was closed
    #[error("{0}")]
    Stream(#[from] StreamError),
}

impl From<CodecError> for StreamError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Stream(e) => e,
            other => StreamError::new(other.to_string()),
        }
    }
}

/// Builds values of a user-defined kind from received payloads.
pub trait Unpacker: Send + Sync {
    /// Kind handled by this unpacker.
    fn kind_id(&self) -> u16;

    /// Builds a message from a payload.
    fn unpack(&self, data: Bytes) -> Result<Msg, DecodeError>;
}

struct DirKind;

impl Unpacker for DirKind {
    fn kind_id(&self) -> u16 {
        kind::DIR
    }

    fn unpack(&self, mut data: Bytes) -> Result<Msg, DecodeError> {
        Ok(Msg::Dir(Dir::decode(&mut data)?))
    }
}

struct AddrKind;

impl Unpacker for AddrKind {
    fn kind_id(&self) -> u16 {
        kind::ADDR
    }

    fn unpack(&self, mut data: Bytes) -> Result<Msg, DecodeError> {
        Ok(Msg::Addr(Addr::decode(&mut data)?))
    }
}

/// Codec configuration.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Maximum payload size accepted and produced
    pub max_msg_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_msg_size: MAX_MSG_SIZE,
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Bytes consumed, header included
    pub size: usize,
    /// Frame tag
    pub tag: u32,
    /// Decoded message
    pub msg: Msg,
}

/// Message codec with a kind registry.
///
/// Clones share the registry.
#[derive(Clone)]
pub struct Codec {
    max_msg_size: usize,
    unpackers: Arc<RwLock<HashMap<u16, Arc<dyn Unpacker>>>>,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("max_msg_size", &self.max_msg_size)
            .field("kinds", &self.unpackers.read().len())
            .finish()
    }
}

impl Codec {
    /// Creates a codec knowing the built-in kinds plus `Dir` and `Addr`.
    pub fn new(config: CodecConfig) -> Self {
        let mut unpackers: HashMap<u16, Arc<dyn Unpacker>> = HashMap::new();
        unpackers.insert(kind::DIR, Arc::new(DirKind));
        unpackers.insert(kind::ADDR, Arc::new(AddrKind));
        Self {
            max_msg_size: config.max_msg_size,
            unpackers: Arc::new(RwLock::new(unpackers)),
        }
    }

    /// Maximum payload size.
    pub fn max_msg_size(&self) -> usize {
        self.max_msg_size
    }

    /// Registers a user-defined kind.
    pub fn define_kind(&self, unpacker: Arc<dyn Unpacker>) -> Result<(), CodecError> {
        let id = unpacker.kind_id();
        if id <= kind::ERR {
            return Err(CodecError::AlreadyDefined(id));
        }
        let mut kinds = self.unpackers.write();
        if kinds.contains_key(&id) {
            return Err(CodecError::AlreadyDefined(id));
        }
        kinds.insert(id, unpacker);
        Ok(())
    }

    /// Appends one frame to `buf`, returning its size.
    pub fn encode(&self, tag: u32, msg: &Msg, buf: &mut BytesMut) -> Result<usize, CodecError> {
        let start = buf.len();
        buf.put_u32_le(0);
        buf.put_u32_le(tag);
        buf.put_u16_le(0);
        let typ = match msg {
            Msg::Bytes(b) => {
                buf.put_slice(b);
                kind::BYTES
            }
            Msg::Ign { typ, data } => {
                buf.put_slice(data);
                *typ
            }
            Msg::Str(s) => {
                buf.put_slice(s.as_bytes());
                kind::STR
            }
            Msg::Err(e) => {
                buf.put_slice(e.message().as_bytes());
                kind::ERR
            }
            Msg::Dir(d) => {
                d.encode(buf);
                kind::DIR
            }
            Msg::Addr(a) => {
                a.encode(buf);
                kind::ADDR
            }
            Msg::Value(v) => {
                let typ = v.kind_id().unwrap_or(kind::IGN);
                if !v.write_payload(buf) {
                    match v.text() {
                        Some(s) => buf.put_slice(s.as_bytes()),
                        None => {
                            buf.truncate(start);
                            return Err(CodecError::Discarded);
                        }
                    }
                }
                typ
            }
        };
        let size = buf.len() - start - HEADER_SIZE;
        if size > self.max_msg_size {
            buf.truncate(start);
            return Err(CodecError::TooLarge(size));
        }
        buf[start..start + 4].copy_from_slice(&(size as u32).to_le_bytes());
        buf[start + 8..start + 10].copy_from_slice(&typ.to_le_bytes());
        Ok(size + HEADER_SIZE)
    }

    /// Builds a message from a payload of the given kind.
    ///
    /// Payloads of unknown kinds, and those their kind fails to unpack,
    /// come back as `Ign` so a bad frame only affects its own stream.
    pub fn decode(&self, typ: u16, data: Bytes) -> Msg {
        match typ {
            kind::BYTES => Msg::Bytes(data),
            kind::STR => Msg::Str(String::from_utf8_lossy(&data).into_owned()),
            kind::ERR => Msg::Err(StreamError::new(String::from_utf8_lossy(&data))),
            _ => {
                let unpacker = self.unpackers.read().get(&typ).cloned();
                match unpacker {
                    Some(u) => match u.unpack(data.clone()) {
                        Ok(msg) => msg,
                        Err(e) => {
                            debug!(kind = typ, error = %e, "unpack failed");
                            Msg::Ign { typ, data }
                        }
                    },
                    None => Msg::Ign { typ, data },
                }
            }
        }
    }

    /// Writes one frame with a single write call.
    pub async fn write_msg<W>(&self, w: &mut W, tag: u32, msg: &Msg) -> Result<usize, CodecError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 64);
        let n = self.encode(tag, msg, &mut buf)?;
        w.write_all(&buf).await?;
        trace!(tag = tag, kind = msg.kind(), size = n, "wrote msg");
        Ok(n)
    }

    /// Reads one frame.
    ///
    /// Returns `Ok(None)` on end of file at a frame boundary; end of file
    /// inside a frame is an I/O error.
    pub async fn read_msg<R>(&self, r: &mut R) -> Result<Option<Frame>, CodecError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut hdr = [0u8; HEADER_SIZE];
        let mut got = 0;
        while got < HEADER_SIZE {
            let n = r.read(&mut hdr[got..]).await?;
            if n == 0 {
                if got == 0 {
                    return Ok(None);
                }
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            got += n;
        }
        let size = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]) as usize;
        let tag = u32::from_le_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
        let typ = u16::from_le_bytes([hdr[8], hdr[9]]);
        if size > self.max_msg_size {
            return Err(CodecError::TooLarge(size));
        }
        let mut data = vec![0u8; size];
        if size > 0 {
            r.read_exact(&mut data).await?;
        }
        let msg = self.decode(typ, Bytes::from(data));
        trace!(tag = tag, kind = typ, size = size, "read msg");
        Ok(Some(Frame {
            size: size + HEADER_SIZE,
            tag,
            msg,
        }))
    }
}
