//! Message values and payload kinds.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use skein_core::StreamError;

use crate::dir::{Addr, Dir};

/// Payload kind identifiers.
pub mod kind {
    /// No payload
    pub const NONE: u16 = 0;
    /// Raw bytes, used as data
    pub const BYTES: u16 = 1;
    /// Bytes ignored as data
    pub const IGN: u16 = 2;
    /// UTF-8 string
    pub const STR: u16 = 3;
    /// Error string
    pub const ERR: u16 = 4;
    /// File address
    pub const ADDR: u16 = 5;
    /// Directory entry
    pub const DIR: u16 = 6;
    /// Reserved for file protocol messages
    pub const ZX: u16 = 7;
    /// First user-defined kind
    pub const USR: u16 = 8;
}

/// Capabilities of a user value sent as a message.
///
/// A value that can write itself is sent with those bytes; otherwise its
/// text is sent. Values with neither are discarded by the codec. The kind
/// used is [`Payload::kind_id`], or `IGN` when it returns `None`.
pub trait Payload: fmt::Debug + Send + Sync + 'static {
    /// Kind to send the value with.
    fn kind_id(&self) -> Option<u16> {
        None
    }

    /// Appends the value's own encoding. Returns false if unsupported.
    fn write_payload(&self, _buf: &mut BytesMut) -> bool {
        false
    }

    /// Textual form of the value.
    fn text(&self) -> Option<String> {
        None
    }

    /// Downcasting support.
    fn as_any(&self) -> &dyn Any;
}

/// A message travelling through a queue or over the wire.
#[derive(Debug, Clone)]
pub enum Msg {
    /// Raw data bytes
    Bytes(Bytes),
    /// Opaque bytes of a kind this side does not interpret
    Ign {
        /// Kind carried on the wire
        typ: u16,
        /// Payload bytes
        data: Bytes,
    },
    /// A string
    Str(String),
    /// An error value
    Err(StreamError),
    /// A directory entry
    Dir(Dir),
    /// A file address
    Addr(Addr),
    /// A user value described by its capabilities
    Value(Arc<dyn Payload>),
}

impl Msg {
    /// Kind used on the wire for this message.
    pub fn kind(&self) -> u16 {
        match self {
            Msg::Bytes(_) => kind::BYTES,
            Msg::Ign { typ, .. } => *typ,
            Msg::Str(_) => kind::STR,
            Msg::Err(_) => kind::ERR,
            Msg::Dir(_) => kind::DIR,
            Msg::Addr(_) => kind::ADDR,
            Msg::Value(v) => v.kind_id().unwrap_or(kind::IGN),
        }
    }

    /// Returns the data bytes, if this is a `Bytes` message.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Msg::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the string, if this is a `Str` message.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Msg::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the error, if this is an `Err` message.
    pub fn as_err(&self) -> Option<&StreamError> {
        match self {
            Msg::Err(e) => Some(e),
            _ => None,
        }
    }

    /// Returns the entry, if this is a `Dir` message.
    pub fn as_dir(&self) -> Option<&Dir> {
        match self {
            Msg::Dir(d) => Some(d),
            _ => None,
        }
    }

    /// Converts into data bytes, if this is a `Bytes` message.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Msg::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl PartialEq for Msg {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Msg::Bytes(a), Msg::Bytes(b)) => a == b,
            (Msg::Ign { typ: ta, data: da }, Msg::Ign { typ: tb, data: db }) => ta == tb && da == db,
            (Msg::Str(a), Msg::Str(b)) => a == b,
            (Msg::Err(a), Msg::Err(b)) => a == b,
            (Msg::Dir(a), Msg::Dir(b)) => a == b,
            (Msg::Addr(a), Msg::Addr(b)) => a == b,
            (Msg::Value(a), Msg::Value(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<Bytes> for Msg {
    fn from(b: Bytes) -> Self {
        Msg::Bytes(b)
    }
}

impl From<Vec<u8>> for Msg {
    fn from(b: Vec<u8>) -> Self {
        Msg::Bytes(Bytes::from(b))
    }
}

impl From<&'static [u8]> for Msg {
    fn from(b: &'static [u8]) -> Self {
        Msg::Bytes(Bytes::from_static(b))
    }
}

impl From<&str> for Msg {
    fn from(s: &str) -> Self {
        Msg::Str(s.to_string())
    }
}

impl From<String> for Msg {
    fn from(s: String) -> Self {
        Msg::Str(s)
    }
}

impl From<StreamError> for Msg {
    fn from(e: StreamError) -> Self {
        Msg::Err(e)
    }
}

impl From<Dir> for Msg {
    fn from(d: Dir) -> Self {
        Msg::Dir(d)
    }
}

impl From<Addr> for Msg {
    fn from(a: Addr) -> Self {
        Msg::Addr(a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Point(u32, u32);

    impl Payload for Point {
        fn kind_id(&self) -> Option<u16> {
            Some(kind::USR + 1)
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_kinds() {
        assert_eq!(Msg::from(&b"x"[..]).kind(), kind::BYTES);
        assert_eq!(Msg::from("x").kind(), kind::STR);
        assert_eq!(Msg::from(StreamError::new("x")).kind(), kind::ERR);
        assert_eq!(Msg::from(Dir::new()).kind(), kind::DIR);
        assert_eq!(
            Msg::Ign {
                typ: 666,
                data: Bytes::new()
            }
            .kind(),
            666
        );
        assert_eq!(Msg::Value(Arc::new(Point(1, 2))).kind(), kind::USR + 1);
    }

    #[test]
    fn test_value_downcast() {
        let m = Msg::Value(Arc::new(Point(1, 2)));
        let Msg::Value(v) = &m else { panic!("not a value") };
        let p = v.as_any().downcast_ref::<Point>().unwrap();
        assert_eq!((p.0, p.1), (1, 2));
        assert_eq!(m.clone(), m);
    }
}
