//! Buffer cursors.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::buffer::Buffer;

/// An open buffer with its own read/write offset.
///
/// Reads and writes go through the buffer lock, so cursors on the same
/// buffer may be used from different tasks.
#[derive(Debug, Clone)]
pub struct BufferFd {
    buf: Buffer,
    pos: usize,
}

impl BufferFd {
    /// Opens `buf` at offset zero.
    pub fn new(buf: Buffer) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// The underlying buffer.
    pub fn buffer(&self) -> &Buffer {
        &self.buf
    }

    /// Reads at `off`, moving the cursor there first.
    pub fn read_at(&mut self, p: &mut [u8], off: usize) -> usize {
        self.pos = off;
        let n = self.buf.read_at(p, off);
        self.pos += n;
        n
    }
}

impl Read for BufferFd {
    fn read(&mut self, p: &mut [u8]) -> io::Result<usize> {
        let n = self.buf.read_at(p, self.pos);
        self.pos += n;
        Ok(n)
    }
}

impl Write for BufferFd {
    fn write(&mut self, p: &[u8]) -> io::Result<usize> {
        let n = self.buf.write_at(p, self.pos);
        self.pos += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for BufferFd {
    /// Offsets before the start clamp to zero.
    fn seek(&mut self, whence: SeekFrom) -> io::Result<u64> {
        let (base, delta) = match whence {
            SeekFrom::Start(off) => (0i128, off as i128),
            SeekFrom::Current(d) => (self.pos as i128, d as i128),
            SeekFrom::End(d) => (self.buf.with_blocks(|b| b.len()) as i128, d as i128),
        };
        let off = (base + delta).max(0);
        if off > isize::MAX as i128 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek offset overflow"));
        }
        self.pos = off as usize;
        Ok(self.pos as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_cursor() {
        let buf = Buffer::with_block_size(8);
        let mut fd = buf.open();
        fd.write_all(b"hello world").unwrap();
        assert_eq!(fd.position(), 11);

        let mut rd = buf.open();
        let mut out = String::new();
        rd.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");

        let mut p = [0u8; 4];
        assert_eq!(rd.read(&mut p).unwrap(), 0);
    }

    #[test]
    fn test_independent_cursors() {
        let buf = Buffer::new();
        buf.write(b"abcdef");
        let mut a = buf.open();
        let mut b = buf.open();
        let mut p = [0u8; 2];
        a.read_exact(&mut p).unwrap();
        assert_eq!(&p, b"ab");
        b.seek(SeekFrom::End(-2)).unwrap();
        b.read_exact(&mut p).unwrap();
        assert_eq!(&p, b"ef");
        a.read_exact(&mut p).unwrap();
        assert_eq!(&p, b"cd");
    }

    #[test]
    fn test_seek_clamps() {
        let buf = Buffer::new();
        buf.write(b"abc");
        let mut fd = buf.open();
        assert_eq!(fd.seek(SeekFrom::Current(-10)).unwrap(), 0);
        assert_eq!(fd.seek(SeekFrom::End(5)).unwrap(), 8);
        fd.write_all(b"!").unwrap();
        assert_eq!(buf.bytes(), b"abc\0\0\0\0\0!");
    }

    #[test]
    fn test_read_at_moves_cursor() {
        let buf = Buffer::new();
        buf.write(b"0123456789");
        let mut fd = buf.open();
        let mut p = [0u8; 3];
        assert_eq!(fd.read_at(&mut p, 5), 3);
        assert_eq!(&p, b"567");
        fd.read_exact(&mut p[..2]).unwrap();
        assert_eq!(&p[..2], b"89");
    }
}
