//! Skein Proto - typed messages on byte streams.
//!
//! Frames are `size[4] tag[4] kind[2] payload[size]`, little-endian:
//! - Built-in kinds for raw bytes, opaque-tagged bytes, strings and errors
//! - Directory entries (`Dir`) and file addresses (`Addr`)
//! - A registry for user-defined kinds
//! - Bridges between byte streams and message queues

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod bridge;
pub mod codec;
pub mod dir;
pub mod encoding;
pub mod msg;

pub use bridge::{merge, read_bytes, read_msgs, write_bytes, write_msgs, Stats};
pub use codec::{Codec, CodecConfig, CodecError, Frame, Unpacker, HEADER_SIZE, MAX_MSG_SIZE, MSG_SIZE};
pub use dir::{Addr, Dir};
pub use encoding::{DecodeError, WireDecode, WireEncode};
pub use msg::{kind, Msg, Payload};
