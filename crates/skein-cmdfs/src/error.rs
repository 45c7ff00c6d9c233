//! Errors returned by file tree operations.

use std::io;

use skein_bufs::BufferError;
use skein_core::StreamError;
use thiserror::Error;

/// File tree errors.
///
/// Variants carrying a `String` hold the path of the file involved, so the
/// rendered error reads `"<path>: <reason>"`.
#[derive(Debug, Error)]
pub enum FsError {
    /// No such file
    #[error("{0}: file does not exist")]
    NotExist(String),

    /// The file is already there
    #[error("{0}: file already exists")]
    Exists(String),

    /// Permission denied, or the operation is not supported by the file
    #[error("{0}: permission denied")]
    Perm(String),

    /// A file was expected
    #[error("{0}: is a directory")]
    IsDir(String),

    /// A directory was expected
    #[error("{0}: not a directory")]
    NotDir(String),

    /// Streaming read of a command that never ran
    #[error("{0}: not started")]
    NotStarted(String),

    /// Second write to a command's `cmd` file
    #[error("{0}: one cmd is enough")]
    AlreadyStarted(String),

    /// Unknown signal name written to `sig`
    #[error("{path}: bad signal '{sig}'")]
    BadSignal {
        /// The `sig` file
        path: String,
        /// What was written
        sig: String,
    },

    /// Unknown request written to a control file
    #[error("{path}: bad ctl request '{req}'")]
    BadCtl {
        /// The control file
        path: String,
        /// What was written
        req: String,
    },

    /// Internal inconsistency
    #[error("{0}: bug")]
    Bug(String),

    /// Error carried in-band by a queue, or a command's exit status
    #[error("{0}")]
    Stream(#[from] StreamError),

    /// Buffer failure
    #[error("{0}")]
    Buffer(#[from] BufferError),

    /// I/O failure
    #[error("{0}")]
    Io(#[from] io::Error),
}

impl FsError {
    /// Returns true for missing files.
    pub fn is_not_exist(&self) -> bool {
        matches!(self, FsError::NotExist(_))
    }

    /// Returns true for permission errors.
    pub fn is_perm(&self) -> bool {
        matches!(self, FsError::Perm(_))
    }
}

impl From<FsError> for StreamError {
    fn from(e: FsError) -> Self {
        match e {
            FsError::Stream(e) => e,
            other => StreamError::new(other.to_string()),
        }
    }
}
