//! Skein Srv - command trees served over a multiplexer.
//!
//! Each request travels on its own RPC stream: the caller sends a `Dir`
//! naming the operation (followed by data for `put`) and closes its side;
//! the server replies with `Dir`s or data and closes the reply, with an
//! error if the operation failed.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod client;
pub mod request;
pub mod server;

pub use client::Client;
pub use request::Request;
pub use server::{serve_conn, Server};

use skein_cmdfs::FsError;
use skein_core::StreamError;
use skein_net::NetError;
use thiserror::Error;

/// Errors from serving or using a remote tree.
#[derive(Debug, Error)]
pub enum SrvError {
    /// Malformed request
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Unexpected message sequence
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The tree refused the operation
    #[error("{0}")]
    Fs(#[from] FsError),

    /// The remote side failed the request
    #[error("{0}")]
    Remote(StreamError),

    /// Local queue failure
    #[error("{0}")]
    Stream(#[from] StreamError),

    /// Transport failure
    #[error("{0}")]
    Net(#[from] NetError),
}

impl SrvError {
    /// Returns the error text as reported by the remote side.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            SrvError::Remote(e) => Some(e.message()),
            _ => None,
        }
    }
}
