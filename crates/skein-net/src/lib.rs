//! Skein Net - message connections and stream multiplexing.
//!
//! Provides the duplex layers on top of the wire codec:
//! - `Conn`: a pair of message queues over a byte device
//! - `Mux`: many logical streams over one device, with flow control
//! - TCP helpers to dial and accept multiplexed connections

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod conn;
pub mod mux;
pub mod transport;

pub use conn::Conn;
pub use mux::{Mux, MuxConfig, MuxStats};
pub use transport::{dial, NetError, TcpListener};
