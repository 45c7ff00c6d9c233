//! Skein Bufs - large and sparse in-memory buffers.
//!
//! Provides:
//! - `Blocks`: the block list, with holes that read as zeros
//! - `Buffer`: a shareable, locked `Blocks` that streams to and from queues
//! - `BufferFd`: an independent cursor implementing `Read`, `Write` and `Seek`

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod blocks;
pub mod buffer;
pub mod fd;

pub use blocks::{Blocks, DEFAULT_BLOCK_SIZE};
pub use buffer::{truncate_opt, Buffer, SendStats};
pub use fd::BufferFd;

use skein_core::StreamError;
use thiserror::Error;

/// Errors from buffer operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// Truncate on a missing buffer to a non-zero size
    #[error("offset out of range in truncate")]
    Nil,

    /// The queue feeding or draining the buffer failed
    #[error("{0}")]
    Stream(#[from] StreamError),
}
