//! Per-operation counters and the `/Ctl` file that exposes them.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use skein_core::{Receiver, Sender};
use skein_proto::Dir;
use tracing::info;

use crate::error::FsError;
use crate::node::{attrs, read_string, send_slice, Caps, Node};

/// Name of the control file at the root.
pub const CTL_NAME: &str = "Ctl";

/// Tree operations that are counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// stat
    Stat,
    /// getdir
    Getdir,
    /// get
    Get,
    /// put
    Put,
    /// mkdir
    Mkdir,
    /// remove
    Remove,
    /// move
    Move,
    /// wstat
    Wstat,
}

impl Op {
    /// Every operation, in report order.
    pub const ALL: [Op; 8] = [
        Op::Stat,
        Op::Getdir,
        Op::Get,
        Op::Put,
        Op::Mkdir,
        Op::Remove,
        Op::Move,
        Op::Wstat,
    ];

    /// Name used in reports and requests.
    pub fn name(self) -> &'static str {
        match self {
            Op::Stat => "stat",
            Op::Getdir => "getdir",
            Op::Get => "get",
            Op::Put => "put",
            Op::Mkdir => "mkdir",
            Op::Remove => "remove",
            Op::Move => "move",
            Op::Wstat => "wstat",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Snapshot of one operation's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpStats {
    /// Calls made
    pub calls: u64,
    /// Calls that failed
    pub errors: u64,
    /// Data bytes moved
    pub bytes: u64,
}

#[derive(Debug, Default)]
struct Counter {
    calls: AtomicU64,
    errors: AtomicU64,
    bytes: AtomicU64,
}

/// Counters for every tree operation.
#[derive(Debug, Default)]
pub struct TreeStats {
    ops: [Counter; 8],
}

impl TreeStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one call.
    pub fn record(&self, op: Op, ok: bool, bytes: u64) {
        let c = &self.ops[op.index()];
        c.calls.fetch_add(1, Ordering::Relaxed);
        if !ok {
            c.errors.fetch_add(1, Ordering::Relaxed);
        }
        c.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Returns the counters for `op`.
    pub fn get(&self, op: Op) -> OpStats {
        let c = &self.ops[op.index()];
        OpStats {
            calls: c.calls.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            bytes: c.bytes.load(Ordering::Relaxed),
        }
    }

    /// Resets every counter.
    pub fn clear(&self) {
        for c in &self.ops {
            c.calls.store(0, Ordering::Relaxed);
            c.errors.store(0, Ordering::Relaxed);
            c.bytes.store(0, Ordering::Relaxed);
        }
    }

    /// Text report, one line per operation.
    pub fn render(&self, name: &str) -> String {
        let mut s = format!("{}:\n", name);
        for op in Op::ALL {
            let st = self.get(op);
            let _ = writeln!(
                s,
                "{}: {} calls {} errs {} bytes",
                op.name(),
                st.calls,
                st.errors,
                st.bytes
            );
        }
        s
    }
}

/// The `/Ctl` file: read for counters, write `clear` to reset them.
pub(crate) struct Ctl {
    name: String,
    owner: String,
    chunk: usize,
    stats: Arc<TreeStats>,
}

impl Ctl {
    pub(crate) fn new(name: String, owner: String, chunk: usize, stats: Arc<TreeStats>) -> Self {
        Self {
            name,
            owner,
            chunk,
            stats,
        }
    }
}

#[async_trait]
impl Node for Ctl {
    fn path(&self) -> String {
        format!("/{}", CTL_NAME)
    }

    fn stat(&self) -> Dir {
        let n = self.stats.render(&self.name).len() as u64;
        attrs(CTL_NAME, "-", 0o644, n, &self.owner)
    }

    fn caps(&self) -> Caps {
        Caps::GET | Caps::PUT
    }

    async fn get(&self, off: u64, count: i64, out: &Sender<Bytes>) -> Result<u64, FsError> {
        let text = self.stats.render(&self.name);
        send_slice(text.as_bytes(), off, count, self.chunk, out).await
    }

    async fn put(&self, _name: &str, _meta: &Dir, _off: u64, input: Receiver<Bytes>) -> Result<u64, FsError> {
        let (req, n) = read_string(&self.path(), input).await?;
        match req.trim() {
            "clear" => {
                self.stats.clear();
                info!(tree = %self.name, "stats cleared");
                Ok(n)
            }
            other => Err(FsError::BadCtl {
                path: self.path(),
                req: other.to_string(),
            }),
        }
    }
}
