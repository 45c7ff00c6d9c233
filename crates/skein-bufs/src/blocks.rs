//! Block lists.
//!
//! A buffer is a list of blocks laid out back to back. A block either owns
//! bytes or is a hole of zeros with no backing memory. No block is larger
//! than the block size, so growing a buffer never creates one huge hole.

use std::io;

use skein_core::KIB;

/// Default block size.
pub const DEFAULT_BLOCK_SIZE: usize = 16 * KIB;

#[derive(Debug, Clone)]
struct Block {
    off: usize,
    /// `None` for holes; otherwise exactly `n` bytes
    data: Option<Vec<u8>>,
    n: usize,
}

/// A list of data and hole blocks.
#[derive(Debug, Clone)]
pub struct Blocks {
    blks: Vec<Block>,
    size: usize,
}

impl Default for Blocks {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl Blocks {
    /// Creates an empty list using `size`-byte blocks.
    pub fn new(size: usize) -> Self {
        Self {
            blks: Vec::new(),
            size: size.max(1),
        }
    }

    /// Block size.
    pub fn block_size(&self) -> usize {
        self.size
    }

    /// Number of blocks.
    pub fn block_count(&self) -> usize {
        self.blks.len()
    }

    /// Logical length in bytes.
    pub fn len(&self) -> usize {
        self.blks.last().map(|b| b.off + b.n).unwrap_or(0)
    }

    /// Returns true if the list holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all content.
    pub fn reset(&mut self) {
        self.blks.clear();
    }

    fn alloc(&self, n: usize) -> Vec<u8> {
        let mut v = Vec::with_capacity(self.size.max(n));
        v.resize(n, 0);
        v
    }

    fn check_len(&self, extra: usize) {
        let len = self.len();
        if len.checked_add(extra).map_or(true, |n| n > isize::MAX as usize) {
            panic!("blocks: overflow: length {} + {} exceeds isize::MAX", len, extra);
        }
    }

    /// Returns the block index and offset within it for `pos`.
    /// Positions at or past the end map to `(block_count, 0)`.
    fn seek(&self, pos: usize) -> (usize, usize) {
        if pos >= self.len() {
            return (self.blks.len(), 0);
        }
        let i = self.blks.partition_point(|b| b.off + b.n <= pos);
        (i, pos - self.blks[i].off)
    }

    /// Spare room of the last block, if it owns bytes.
    fn last_room(&self) -> usize {
        match self.blks.last() {
            Some(Block { data: Some(d), .. }) => self.size.saturating_sub(d.len()),
            _ => 0,
        }
    }

    /// Extends the list by `nz` zero bytes.
    fn grow(&mut self, mut nz: usize) {
        self.check_len(nz);
        let size = self.size;
        if let Some(last) = self.blks.last_mut() {
            let lz = match &mut last.data {
                None => size.saturating_sub(last.n).min(nz),
                Some(d) => {
                    let lz = size.saturating_sub(d.len()).min(nz);
                    d.resize(d.len() + lz, 0);
                    lz
                }
            };
            last.n += lz;
            nz -= lz;
        }
        let mut off = self.len();
        while nz > 0 {
            let n = nz.min(size);
            self.blks.push(Block { off, data: None, n });
            off += n;
            nz -= n;
        }
    }

    /// Sets the length to `n`, adding holes or dropping tail bytes.
    pub fn truncate(&mut self, n: usize) {
        let sz = self.len();
        if n == sz {
            return;
        }
        if n > sz {
            self.grow(n - sz);
            return;
        }
        let (nb, boff) = self.seek(n);
        if boff == 0 {
            self.blks.truncate(nb);
            return;
        }
        self.blks.truncate(nb + 1);
        let blk = &mut self.blks[nb];
        blk.n = n - blk.off;
        if let Some(d) = &mut blk.data {
            // Later growth must read back as zeros.
            d.truncate(blk.n);
        }
    }

    /// Appends `p`, filling the last block before allocating new ones.
    pub fn write(&mut self, mut p: &[u8]) -> usize {
        self.check_len(p.len());
        let nw = p.len();
        if nw == 0 {
            return 0;
        }
        let room = self.last_room().min(p.len());
        if room > 0 {
            if let Some(last) = self.blks.last_mut() {
                if let Some(d) = &mut last.data {
                    d.extend_from_slice(&p[..room]);
                    last.n += room;
                }
            }
            p = &p[room..];
        }
        while !p.is_empty() {
            let n = p.len().min(self.size);
            let mut data = Vec::with_capacity(self.size);
            data.extend_from_slice(&p[..n]);
            let off = self.len();
            self.blks.push(Block {
                off,
                data: Some(data),
                n,
            });
            p = &p[n..];
        }
        nw
    }

    /// Writes `p` at offset `at`, overwriting existing bytes.
    ///
    /// Writing past the end first extends the list with a hole.
    pub fn write_at(&mut self, mut p: &[u8], at: usize) -> usize {
        let nw = p.len();
        self.check_len(at.saturating_sub(self.len()));
        if at > self.len() {
            self.grow(at - self.len());
        }
        let len = self.len();
        if at < len {
            let mut left = (len - at).min(p.len());
            let (mut nb, mut boff) = self.seek(at);
            while left > 0 {
                let n = left.min(self.blks[nb].n - boff);
                let blk_n = self.blks[nb].n;
                if self.blks[nb].data.is_none() {
                    let fresh = self.alloc(blk_n);
                    self.blks[nb].data = Some(fresh);
                }
                if let Some(d) = &mut self.blks[nb].data {
                    d[boff..boff + n].copy_from_slice(&p[..n]);
                }
                p = &p[n..];
                left -= n;
                nb += 1;
                boff = 0;
            }
        }
        self.write(p);
        nw
    }

    /// Reads into `p` from offset `off`, returning the bytes read.
    ///
    /// Holes that are read become zeroed data blocks.
    pub fn read_at(&mut self, p: &mut [u8], off: usize) -> usize {
        if off >= self.len() {
            return 0;
        }
        let (mut nb, mut boff) = self.seek(off);
        let mut tot = 0;
        while tot < p.len() && nb < self.blks.len() {
            let blk_n = self.blks[nb].n;
            let n = (p.len() - tot).min(blk_n - boff);
            if self.blks[nb].data.is_none() {
                let fresh = self.alloc(blk_n);
                self.blks[nb].data = Some(fresh);
            }
            if let Some(d) = &self.blks[nb].data {
                p[tot..tot + n].copy_from_slice(&d[boff..boff + n]);
            }
            tot += n;
            nb += 1;
            boff = 0;
        }
        tot
    }

    /// Copies out up to `max` bytes at `off` without touching holes.
    ///
    /// Returns at most one block's worth; empty at or past the end.
    pub fn chunk_at(&self, off: usize, max: usize) -> Vec<u8> {
        if off >= self.len() || max == 0 {
            return Vec::new();
        }
        let (nb, boff) = self.seek(off);
        let blk = &self.blks[nb];
        let n = max.min(blk.n - boff);
        match &blk.data {
            Some(d) => d[boff..boff + n].to_vec(),
            None => vec![0; n],
        }
    }

    /// Returns the whole content in one vector.
    pub fn bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len()];
        for blk in &self.blks {
            if let Some(d) = &blk.data {
                out[blk.off..blk.off + blk.n].copy_from_slice(d);
            }
        }
        out
    }

    /// Writes the whole content to `w`.
    pub fn write_to<W: io::Write>(&self, w: &mut W) -> io::Result<u64> {
        let zeros = vec![0u8; self.size];
        let mut tot = 0u64;
        for blk in &self.blks {
            match &blk.data {
                Some(d) => w.write_all(d)?,
                None => w.write_all(&zeros[..blk.n])?,
            }
            tot += blk.n as u64;
        }
        Ok(tot)
    }

    /// Verifies the block layout, describing the first violation found.
    pub fn check(&self) -> Result<(), String> {
        let mut off = 0;
        for (i, blk) in self.blks.iter().enumerate() {
            if blk.off != off {
                return Err(format!("block {}: off {} != {}", i, blk.off, off));
            }
            if blk.n == 0 {
                return Err(format!("block {}: empty", i));
            }
            if blk.n > self.size {
                return Err(format!("block {}: size {} > {}", i, blk.n, self.size));
            }
            if let Some(d) = &blk.data {
                if d.len() != blk.n {
                    return Err(format!("block {}: data len {} != {}", i, d.len(), blk.n));
                }
            }
            off += blk.n;
        }
        Ok(())
    }

    /// Number of hole blocks.
    pub fn hole_count(&self) -> usize {
        self.blks.iter().filter(|b| b.data.is_none()).count()
    }
}
