//! In-band stream errors.
//!
//! A `StreamError` is the close reason of a queue. It travels through
//! queues and across the wire as text, so it only keeps the message.

use std::fmt;
use std::sync::Arc;

/// Error value carried by a closed stream.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct StreamError(Arc<str>);

impl StreamError {
    /// Creates an error with the given message.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(Arc::from(msg.into()))
    }

    /// The error reported when sending on a queue closed without a reason.
    pub fn closed() -> Self {
        Self::new("closed")
    }

    /// Returns the error text.
    pub fn message(&self) -> &str {
        &self.0
    }

    /// Returns an error with `prefix: ` prepended to the message.
    pub fn context(&self, prefix: &str) -> Self {
        Self::new(format!("{}: {}", prefix, self.0))
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamError({:?})", &*self.0)
    }
}

impl std::error::Error for StreamError {}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<StreamError> for std::io::Error {
    fn from(e: StreamError) -> Self {
        std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_and_display() {
        let e = StreamError::new("oops");
        assert_eq!(e.message(), "oops");
        assert_eq!(e.to_string(), "oops");
        assert_eq!(e.clone(), e);
    }

    #[test]
    fn test_context() {
        let e = StreamError::from("no such file").context("/e0/x");
        assert_eq!(e.message(), "/e0/x: no such file");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let e = StreamError::from(io);
        assert_eq!(e.message(), "pipe gone");
    }
}
