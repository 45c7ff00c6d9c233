//! Skein Core - shared primitives for the skein channel layer.
//!
//! Provides the pieces every other skein crate builds on:
//! - Bounded message queues whose close event may carry an error
//! - The cloneable in-band stream error value
//! - Common size constants

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod chan;
pub mod error;

pub use chan::{channel, preloaded, Closer, Receiver, Sender};
pub use error::StreamError;

/// One kibibyte.
pub const KIB: usize = 1024;

/// One mebibyte.
pub const MIB: usize = 1024 * KIB;
