//! Shared buffers.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use skein_core::{Receiver, Sender};
use tracing::trace;

use crate::blocks::{Blocks, DEFAULT_BLOCK_SIZE};
use crate::fd::BufferFd;
use crate::BufferError;

/// Counters returned by [`Buffer::send_to`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SendStats {
    /// Bytes sent
    pub bytes: u64,
    /// Messages sent
    pub msgs: u64,
}

/// A block list shared behind one lock.
///
/// Clones refer to the same content.
#[derive(Clone, Default)]
pub struct Buffer {
    inner: Arc<Mutex<Blocks>>,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.inner.lock();
        f.debug_struct("Buffer")
            .field("len", &b.len())
            .field("blocks", &b.block_count())
            .finish()
    }
}

impl Buffer {
    /// Creates an empty buffer with the default block size.
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    /// Creates an empty buffer using `size`-byte blocks.
    pub fn with_block_size(size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Blocks::new(size))),
        }
    }

    /// Logical length in bytes.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns true if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all content.
    pub fn reset(&self) {
        self.inner.lock().reset();
    }

    /// Sets the length to `n`.
    pub fn truncate(&self, n: usize) {
        self.inner.lock().truncate(n);
    }

    /// Appends a copy of `p`.
    pub fn write(&self, p: &[u8]) -> usize {
        self.inner.lock().write(p)
    }

    /// Writes a copy of `p` at offset `at`; holes are fine.
    pub fn write_at(&self, p: &[u8], at: usize) -> usize {
        self.inner.lock().write_at(p, at)
    }

    /// Reads into `p` from `off`; zero at or past the end.
    pub fn read_at(&self, p: &mut [u8], off: usize) -> usize {
        self.inner.lock().read_at(p, off)
    }

    /// Returns the whole content. Beware of large sparse buffers.
    pub fn bytes(&self) -> Vec<u8> {
        self.inner.lock().bytes()
    }

    /// Writes the whole content to `w`.
    pub fn write_to<W: io::Write>(&self, w: &mut W) -> io::Result<u64> {
        self.inner.lock().write_to(w)
    }

    /// Opens a cursor at offset zero.
    pub fn open(&self) -> BufferFd {
        BufferFd::new(self.clone())
    }

    /// Verifies the block layout.
    pub fn check(&self) -> Result<(), String> {
        self.inner.lock().check()
    }

    /// Copies the content as a list of chunks of at most one block each.
    pub fn chunks(&self) -> Vec<Bytes> {
        let b = self.inner.lock();
        let mut out = Vec::new();
        let mut off = 0;
        loop {
            let c = b.chunk_at(off, b.block_size());
            if c.is_empty() {
                return out;
            }
            off += c.len();
            out.push(Bytes::from(c));
        }
    }

    pub(crate) fn with_blocks<T>(&self, f: impl FnOnce(&mut Blocks) -> T) -> T {
        f(&mut self.inner.lock())
    }

    /// Sends `count` bytes starting at `off` to `tx`, in chunks of at most
    /// one block. A negative count means up to the end.
    ///
    /// The lock is released while each chunk is being sent. The queue is not
    /// closed.
    pub async fn send_to(&self, off: usize, count: i64, tx: &Sender<Bytes>) -> Result<SendStats, BufferError> {
        let mut stats = SendStats::default();
        let mut off = off;
        let mut left = if count < 0 { usize::MAX } else { count as usize };
        while left > 0 {
            let chunk = {
                let b = self.inner.lock();
                b.chunk_at(off, left.min(b.block_size()))
            };
            if chunk.is_empty() {
                break;
            }
            let n = chunk.len();
            tx.send(Bytes::from(chunk)).await?;
            off += n;
            left -= n;
            stats.bytes += n as u64;
            stats.msgs += 1;
        }
        trace!(bytes = stats.bytes, msgs = stats.msgs, "buffer sent");
        Ok(stats)
    }

    /// Appends everything received from `rx` until it ends or an empty
    /// chunk arrives. Returns the bytes received, or the queue's close error.
    pub async fn recv_from(&self, rx: &mut Receiver<Bytes>) -> Result<u64, BufferError> {
        let mut tot = 0u64;
        while let Some(data) = rx.recv().await {
            if data.is_empty() {
                break;
            }
            self.write(&data);
            tot += data.len() as u64;
        }
        match rx.error() {
            Some(e) => Err(e.into()),
            None => Ok(tot),
        }
    }

    /// Like [`Buffer::recv_from`], writing at `off` instead of appending.
    pub async fn recv_at_from(&self, off: usize, rx: &mut Receiver<Bytes>) -> Result<u64, BufferError> {
        let mut tot = 0usize;
        while let Some(data) = rx.recv().await {
            if data.is_empty() {
                break;
            }
            self.write_at(&data, off + tot);
            tot += data.len();
        }
        match rx.error() {
            Some(e) => Err(e.into()),
            None => Ok(tot as u64),
        }
    }
}

/// Truncates a buffer that may be missing.
///
/// Truncating a missing buffer to zero is a no-op; to anything else, an
/// error.
pub fn truncate_opt(b: Option<&Buffer>, n: usize) -> Result<(), BufferError> {
    match b {
        Some(b) => {
            b.truncate(n);
            Ok(())
        }
        None if n == 0 => Ok(()),
        None => Err(BufferError::Nil),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::{channel, preloaded, StreamError};

    #[tokio::test]
    async fn test_send_to_chunks() {
        let b = Buffer::with_block_size(4);
        b.write(b"0123456789");
        let (tx, rx) = channel(16);
        let stats = b.send_to(3, 5, &tx).await.unwrap();
        assert_eq!(stats, SendStats { bytes: 5, msgs: 2 });
        drop(tx);
        let (chunks, _) = rx.drain().await;
        assert_eq!(chunks, vec![Bytes::from_static(b"3"), Bytes::from_static(b"4567")]);
    }

    #[tokio::test]
    async fn test_send_to_end() {
        let b = Buffer::with_block_size(4);
        b.write(b"abcdef");
        let (tx, rx) = channel(16);
        b.send_to(0, -1, &tx).await.unwrap();
        let stats = b.send_to(6, -1, &tx).await.unwrap();
        assert_eq!(stats.msgs, 0);
        drop(tx);
        let (chunks, _) = rx.drain().await;
        let all: Vec<u8> = chunks.iter().flat_map(|c| c.to_vec()).collect();
        assert_eq!(all, b"abcdef");
    }

    #[tokio::test]
    async fn test_send_to_closed_queue() {
        let b = Buffer::new();
        b.write(b"abc");
        let (tx, mut rx) = channel::<Bytes>(1);
        rx.close_with(Some(StreamError::new("reader gone")));
        let err = b.send_to(0, -1, &tx).await.unwrap_err();
        assert_eq!(err, BufferError::Stream(StreamError::new("reader gone")));
    }

    #[tokio::test]
    async fn test_send_to_holes() {
        let b = Buffer::with_block_size(8);
        b.truncate(12);
        let (tx, rx) = channel(16);
        b.send_to(0, -1, &tx).await.unwrap();
        drop(tx);
        let (chunks, _) = rx.drain().await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.iter().all(|x| *x == 0)));
        b.with_blocks(|bl| assert_eq!(bl.hole_count(), 2));
    }

    #[tokio::test]
    async fn test_recv_from() {
        let b = Buffer::new();
        b.write(b">");
        let mut rx = preloaded(vec![
            Bytes::from_static(b"ab"),
            Bytes::from_static(b"cd"),
            Bytes::new(),
            Bytes::from_static(b"ignored"),
        ]);
        assert_eq!(b.recv_from(&mut rx).await.unwrap(), 4);
        assert_eq!(b.bytes(), b">abcd");
    }

    #[tokio::test]
    async fn test_recv_from_error() {
        let b = Buffer::new();
        let (tx, mut rx) = channel(4);
        tx.send(Bytes::from_static(b"x")).await.unwrap();
        tx.close_with(Some(StreamError::new("cut")));
        let err = b.recv_from(&mut rx).await.unwrap_err();
        assert_eq!(err.to_string(), "cut");
        assert_eq!(b.bytes(), b"x");
    }

    #[tokio::test]
    async fn test_recv_at_from() {
        let b = Buffer::new();
        b.write(b"hello world");
        let mut rx = preloaded(vec![Bytes::from_static(b"W"), Bytes::from_static(b"ORLD")]);
        b.recv_at_from(6, &mut rx).await.unwrap();
        assert_eq!(b.bytes(), b"hello WORLD");
    }

    #[test]
    fn test_chunks_snapshot() {
        let b = Buffer::with_block_size(4);
        b.write(b"abcdefghij");
        let chunks = b.chunks();
        assert_eq!(chunks.len(), 3);
        b.write(b"more");
        assert_eq!(chunks.concat(), b"abcdefghij");
    }

    #[test]
    fn test_truncate_opt() {
        assert_eq!(truncate_opt(None, 0), Ok(()));
        assert_eq!(truncate_opt(None, 3), Err(BufferError::Nil));
        let b = Buffer::new();
        truncate_opt(Some(&b), 3).unwrap();
        assert_eq!(b.len(), 3);
    }
}
