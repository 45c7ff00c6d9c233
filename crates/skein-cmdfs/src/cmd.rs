//! One command: a directory of files controlling a single process run.
//!
//! ```text
//! cmd   script; writing it starts the command (once)
//! in    stdin, fed before the start
//! out   stdout captured so far
//! err   stderr captured so far
//! pout  streaming stdout
//! perr  streaming stderr
//! sts   status
//! wait  status, once the command is done
//! sig   write a signal name
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use skein_bufs::Buffer;
use skein_core::{channel, preloaded, Receiver, Sender, StreamError};
use skein_proto::Dir;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CmdFsConfig;
use crate::env::{EnvCommand, Worker};
use crate::error::FsError;
use crate::interp::{Child, Sig, Status};
use crate::node::{attrs, read_string, send_slice, Caps, Node};

/// Queue size between a child's output and its collector.
const COLLECT_NBUF: usize = 64;

/// Files inside a command directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdFileId {
    /// Script text
    Cmd,
    /// Standard input
    In,
    /// Captured stdout
    Out,
    /// Captured stderr
    Err,
    /// Streaming stdout
    Pout,
    /// Streaming stderr
    Perr,
    /// Status
    Sts,
    /// Status after exit
    Wait,
    /// Signal posting
    Sig,
}

/// Name, id and mode of each command file, in listing order.
pub const CMD_FILES: [(&str, CmdFileId, u32); 9] = [
    ("cmd", CmdFileId::Cmd, 0o644),
    ("in", CmdFileId::In, 0o660),
    ("out", CmdFileId::Out, 0o440),
    ("err", CmdFileId::Err, 0o440),
    ("pout", CmdFileId::Pout, 0o440),
    ("perr", CmdFileId::Perr, 0o440),
    ("sts", CmdFileId::Sts, 0o440),
    ("wait", CmdFileId::Wait, 0o440),
    ("sig", CmdFileId::Sig, 0o220),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Out,
    Err,
}

/// Output collected from the child, plus readers waiting for more.
struct Output {
    buf: Buffer,
    eof: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

impl Output {
    fn new() -> Self {
        Self {
            buf: Buffer::new(),
            eof: false,
            waiters: Vec::new(),
        }
    }

    fn wakeup(&mut self) {
        for w in self.waiters.drain(..) {
            let _ = w.send(());
        }
    }
}

struct CmdState {
    txt: String,
    input: Buffer,
    out: Output,
    err: Output,
    started: bool,
    removed: bool,
    restart: bool,
    child: Option<Child>,
    status: Option<Status>,
}

impl CmdState {
    fn output(&mut self, which: Stream) -> &mut Output {
        match which {
            Stream::Out => &mut self.out,
            Stream::Err => &mut self.err,
        }
    }
}

struct CmdInner {
    name: String,
    path: String,
    config: Arc<CmdFsConfig>,
    worker: Worker,
    state: Mutex<CmdState>,
    done: watch::Sender<bool>,
}

/// A command directory. Clones share the command.
#[derive(Clone)]
pub struct Cmd {
    inner: Arc<CmdInner>,
}

impl Cmd {
    pub(crate) fn new(env_path: &str, name: &str, config: Arc<CmdFsConfig>, worker: Worker) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(CmdInner {
                name: name.to_string(),
                path: format!("{}/{}", env_path, name),
                config,
                worker,
                state: Mutex::new(CmdState {
                    txt: String::new(),
                    input: Buffer::new(),
                    out: Output::new(),
                    err: Output::new(),
                    started: false,
                    removed: false,
                    restart: false,
                    child: None,
                    status: None,
                }),
                done,
            }),
        }
    }

    /// Command name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns true once the script has been written.
    pub fn is_started(&self) -> bool {
        self.inner.state.lock().started
    }

    /// Returns true if a `restart` signal was posted.
    pub fn restart_requested(&self) -> bool {
        self.inner.state.lock().restart
    }

    /// Status text as reported by `sts`.
    pub fn status(&self) -> String {
        let st = self.inner.state.lock();
        if !st.started {
            return "not started\n".to_string();
        }
        match &st.status {
            None => "running\n".to_string(),
            Some(Ok(())) => "success\n".to_string(),
            Some(Err(e)) => format!("{}\n", e),
        }
    }

    /// Starts the command with script `txt`.
    ///
    /// The input written so far becomes the child's stdin. Fails if the
    /// command was already started.
    pub async fn start(&self, txt: String) -> Result<(), FsError> {
        let stdin = {
            let mut st = self.inner.state.lock();
            if st.started {
                return Err(FsError::AlreadyStarted(self.inner.path.clone()));
            }
            st.started = true;
            st.txt = txt.clone();
            if st.input.is_empty() {
                None
            } else {
                Some(preloaded(st.input.chunks()))
            }
        };

        let (out_tx, out_rx) = channel(COLLECT_NBUF);
        let (err_tx, err_rx) = channel(COLLECT_NBUF);
        let collectors = vec![
            tokio::spawn(self.clone().collect(Stream::Out, out_rx)),
            tokio::spawn(self.clone().collect(Stream::Err, err_rx)),
        ];

        let (reply_tx, reply_rx) = oneshot::channel();
        let spawn = EnvCommand::Spawn {
            script: txt,
            stdin,
            stdout: out_tx,
            stderr: err_tx,
            reply: reply_tx,
        };
        let spawned = match self.inner.worker.send(spawn).await {
            Ok(()) => match reply_rx.await {
                Ok(res) => res,
                Err(_) => Err(FsError::Bug(self.inner.path.clone())),
            },
            Err(e) => Err(e),
        };

        match spawned {
            Ok(child) => {
                info!(path = %self.inner.path, pid = ?child.pid(), "command started");
                let removed = {
                    let mut st = self.inner.state.lock();
                    st.child = Some(child.clone());
                    st.removed
                };
                if removed {
                    self.kill();
                }
                tokio::spawn(self.clone().supervise(child, collectors));
                Ok(())
            }
            Err(e) => {
                warn!(path = %self.inner.path, error = %e, "command failed to start");
                self.clone()
                    .finish(Err(StreamError::new(e.to_string())), collectors)
                    .await;
                Err(e)
            }
        }
    }

    /// Appends what the child writes on one stream to its buffer.
    async fn collect(self, which: Stream, mut rx: Receiver<Bytes>) {
        while let Some(data) = rx.recv().await {
            let mut st = self.inner.state.lock();
            let o = st.output(which);
            o.buf.write(&data);
            o.wakeup();
        }
        let mut st = self.inner.state.lock();
        let o = st.output(which);
        o.eof = true;
        o.wakeup();
        debug!(path = %self.inner.path, stream = ?which, bytes = o.buf.len(), "output closed");
    }

    async fn supervise(self, child: Child, collectors: Vec<JoinHandle<()>>) {
        let status = child.wait().await;
        self.finish(status, collectors).await;
    }

    async fn finish(self, status: Status, collectors: Vec<JoinHandle<()>>) {
        for c in collectors {
            let _ = c.await;
        }
        debug!(path = %self.inner.path, status = ?status, "command done");
        {
            let mut st = self.inner.state.lock();
            st.status = Some(status);
            st.out.wakeup();
            st.err.wakeup();
        }
        self.inner.done.send_replace(true);
    }

    /// Waits until the command is done. Returns at once if it never started.
    pub async fn wait(&self) {
        if !self.is_started() {
            return;
        }
        let mut done = self.inner.done.subscribe();
        let _ = done.wait_for(|d| *d).await;
    }

    /// Posts a signal by name.
    pub async fn post(&self, sig: &str) -> Result<(), FsError> {
        let sig: Sig = sig.parse().map_err(|_| FsError::BadSignal {
            path: format!("{}/sig", self.inner.path),
            sig: sig.trim().to_string(),
        })?;
        let Some(child) = self.inner.state.lock().child.clone() else {
            return Ok(());
        };
        info!(path = %self.inner.path, signal = ?sig, "posting");
        child.signal(sig.signal())?;
        if sig == Sig::Restart {
            tokio::time::sleep(self.inner.config.restart_grace()).await;
            if child.try_status().is_none() {
                child.signal(Sig::Kill.signal())?;
            }
            self.inner.state.lock().restart = true;
        }
        Ok(())
    }

    fn kill(&self) {
        let child = self.inner.state.lock().child.clone();
        if let Some(child) = child {
            if let Err(e) = child.signal(Sig::Kill.signal()) {
                warn!(path = %self.inner.path, error = %e, "kill failed");
            }
        }
    }

    /// Called once the command is removed from its environment.
    pub(crate) fn removed(&self) {
        self.inner.state.lock().removed = true;
        self.kill();
    }

    fn clear_input(&self) {
        let st = self.inner.state.lock();
        if !st.started {
            st.input.reset();
        }
    }

    async fn put_input(&self, meta: &Dir, mut input: Receiver<Bytes>) -> Result<u64, FsError> {
        let buf = {
            let st = self.inner.state.lock();
            if st.started {
                return Err(FsError::Perm(format!("{}/in", self.inner.path)));
            }
            if meta.contains("mode") {
                st.input.reset();
            }
            st.input.clone()
        };
        Ok(buf.recv_from(&mut input).await?)
    }

    fn buffer(&self, id: CmdFileId) -> Buffer {
        let st = self.inner.state.lock();
        match id {
            CmdFileId::In => st.input.clone(),
            CmdFileId::Out | CmdFileId::Pout => st.out.buf.clone(),
            _ => st.err.buf.clone(),
        }
    }

    /// Streaming read: returns as soon as some data past `off` was sent,
    /// blocking until there is some or the output ends.
    async fn get_streaming(&self, which: Stream, off: u64, count: i64, out: &Sender<Bytes>) -> Result<u64, FsError> {
        if !self.is_started() {
            return Err(FsError::NotStarted(self.inner.path.clone()));
        }
        let buf = self.inner.state.lock().output(which).buf.clone();
        let mut off = off;
        let mut tot = 0u64;
        while count != 0 {
            let n = buf.send_to(usize::try_from(off).unwrap_or(usize::MAX), count, out).await?.bytes;
            if n > 0 {
                tot += n;
                off += n;
                if count > 0 {
                    break;
                }
                continue;
            }

            let waiter = {
                let mut st = self.inner.state.lock();
                if st.output(which).buf.len() as u64 > off {
                    continue;
                }
                if let Some(status) = st.status.clone() {
                    return status.map(|_| tot).map_err(FsError::Stream);
                }
                let o = st.output(which);
                if o.eof {
                    return Ok(tot);
                }
                let (tx, rx) = oneshot::channel();
                o.waiters.push(tx);
                rx
            };
            tokio::select! {
                _ = waiter => {}
                _ = out.closed() => {
                    return Err(FsError::Stream(out.error().unwrap_or_else(StreamError::closed)));
                }
            }
        }
        Ok(tot)
    }

    fn file(&self, name: &str) -> Option<CmdFile> {
        CMD_FILES
            .iter()
            .find(|(n, _, _)| *n == name)
            .map(|&(name, id, mode)| CmdFile {
                cmd: self.clone(),
                name,
                id,
                mode,
            })
    }
}

#[async_trait]
impl Node for Cmd {
    fn path(&self) -> String {
        self.inner.path.clone()
    }

    fn stat(&self) -> Dir {
        let mut d = attrs(
            &self.inner.name,
            "d",
            0o755,
            CMD_FILES.len() as u64,
            &self.inner.config.owner,
        );
        if self.restart_requested() {
            d.set("restart", "y");
        }
        d
    }

    fn caps(&self) -> Caps {
        Caps::WALK | Caps::GETDIR
    }

    fn walk(&self, name: &str) -> Result<Arc<dyn Node>, FsError> {
        match self.file(name) {
            Some(f) => Ok(Arc::new(f)),
            None => Err(FsError::NotExist(format!("{}/{}", self.inner.path, name))),
        }
    }

    fn getdir(&self) -> Result<Vec<String>, FsError> {
        Ok(CMD_FILES.iter().map(|(n, _, _)| n.to_string()).collect())
    }
}

/// One of the files inside a command directory.
pub struct CmdFile {
    cmd: Cmd,
    name: &'static str,
    id: CmdFileId,
    mode: u32,
}

#[async_trait]
impl Node for CmdFile {
    fn path(&self) -> String {
        format!("{}/{}", self.cmd.inner.path, self.name)
    }

    fn stat(&self) -> Dir {
        let size = match self.id {
            CmdFileId::Cmd => self.cmd.inner.state.lock().txt.len(),
            CmdFileId::In | CmdFileId::Out | CmdFileId::Err | CmdFileId::Pout | CmdFileId::Perr => {
                self.cmd.buffer(self.id).len()
            }
            CmdFileId::Sts => self.cmd.status().len(),
            CmdFileId::Wait | CmdFileId::Sig => 0,
        };
        attrs(self.name, "-", self.mode, size as u64, &self.cmd.inner.config.owner)
    }

    fn caps(&self) -> Caps {
        match self.id {
            CmdFileId::Cmd => Caps::GET | Caps::PUT,
            CmdFileId::In => Caps::GET | Caps::PUT | Caps::WSTAT,
            CmdFileId::Sig => Caps::PUT,
            _ => Caps::GET,
        }
    }

    async fn get(&self, off: u64, count: i64, out: &Sender<Bytes>) -> Result<u64, FsError> {
        let chunk = self.cmd.inner.config.chunk_size;
        match self.id {
            CmdFileId::Cmd => {
                let txt = self.cmd.inner.state.lock().txt.clone();
                send_slice(txt.as_bytes(), off, count, chunk, out).await
            }
            CmdFileId::In | CmdFileId::Out | CmdFileId::Err => {
                let buf = self.cmd.buffer(self.id);
                let off = usize::try_from(off).unwrap_or(usize::MAX);
                Ok(buf.send_to(off, count, out).await?.bytes)
            }
            CmdFileId::Pout => self.cmd.get_streaming(Stream::Out, off, count, out).await,
            CmdFileId::Perr => self.cmd.get_streaming(Stream::Err, off, count, out).await,
            CmdFileId::Wait | CmdFileId::Sts => {
                if self.id == CmdFileId::Wait {
                    self.cmd.wait().await;
                }
                let sts = self.cmd.status();
                send_slice(sts.as_bytes(), off, count, chunk, out).await
            }
            CmdFileId::Sig => Err(FsError::Perm(self.path())),
        }
    }

    async fn put(&self, _name: &str, meta: &Dir, _off: u64, input: Receiver<Bytes>) -> Result<u64, FsError> {
        match self.id {
            CmdFileId::In => self.cmd.put_input(meta, input).await,
            CmdFileId::Cmd => {
                let (txt, n) = read_string(&self.path(), input).await?;
                self.cmd.start(txt).await?;
                Ok(n)
            }
            CmdFileId::Sig => {
                let (sig, n) = read_string(&self.path(), input).await?;
                self.cmd.post(&sig).await?;
                Ok(n)
            }
            _ => Err(FsError::Perm(self.path())),
        }
    }

    async fn wstat(&self, d: &Dir) -> Result<(), FsError> {
        if self.id == CmdFileId::In && d.contains("size") && d.size() == 0 {
            self.cmd.clear_input();
            return Ok(());
        }
        Err(FsError::Perm(self.path()))
    }
}
