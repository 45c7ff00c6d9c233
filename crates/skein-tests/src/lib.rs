//! Integration and end-to-end tests for skein.
//!
//! This crate provides:
//! - A test server harness serving a command tree over an in-memory or TCP mux
//! - End-to-end tests for the codec, the mux, buffers and the command tree

pub mod harness;

pub use harness::TestServer;
