//! Path based access to the command tree.
//!
//! [`Tree`] resolves paths to nodes, checks capabilities and permissions,
//! counts every call, and closes the data queues it is given with the
//! operation's outcome.

use std::sync::Arc;

use bytes::Bytes;
use skein_core::{channel, preloaded, Receiver, Sender, StreamError};
use skein_proto::Dir;
use tracing::{debug, trace};

use crate::cmd::Cmd;
use crate::config::CmdFsConfig;
use crate::ctl::{Op, TreeStats};
use crate::error::FsError;
use crate::interp::{Interp, ShellInterp};
use crate::node::{Caps, Node};
use crate::policy::{AllowAll, Policy, Who};
use crate::root::Root;

/// Queue size used by the whole-file helpers.
const GET_ALL_NBUF: usize = 16;

/// Splits a path into its elements, resolving `.` and `..`.
pub fn path_elems(path: &str) -> Vec<&str> {
    let mut elems = Vec::new();
    for e in path.split('/') {
        match e {
            "" | "." => {}
            ".." => {
                elems.pop();
            }
            e => elems.push(e),
        }
    }
    elems
}

/// Returns the clean, absolute form of `path`.
pub fn clean_path(path: &str) -> String {
    format!("/{}", path_elems(path).join("/"))
}

#[derive(Debug, Clone, Copy)]
enum Access {
    Read,
    Write,
    Exec,
}

/// The command tree, seen by one caller. Clones share the tree.
#[derive(Clone)]
pub struct Tree {
    root: Arc<Root>,
    config: Arc<CmdFsConfig>,
    stats: Arc<TreeStats>,
    policy: Arc<dyn Policy>,
    who: Option<Who>,
}

impl Tree {
    /// Creates a tree running commands with the configured shell.
    pub fn new(config: CmdFsConfig) -> Self {
        let interp = Arc::new(ShellInterp::from_config(&config));
        Self::with_interp(config, interp)
    }

    /// Creates a tree running commands with `interp`.
    pub fn with_interp(config: CmdFsConfig, interp: Arc<dyn Interp>) -> Self {
        let config = Arc::new(config);
        let stats = Arc::new(TreeStats::new());
        let root = Arc::new(Root::new(config.clone(), interp, stats.clone()));
        Self {
            root,
            config,
            stats,
            policy: Arc::new(AllowAll),
            who: None,
        }
    }

    /// Sets the permission policy used for authenticated views.
    pub fn with_policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.policy = policy;
        self
    }

    /// Returns a view of the tree whose calls are checked for `who`.
    pub fn auth_for(&self, who: Who) -> Tree {
        Tree {
            who: Some(who),
            ..self.clone()
        }
    }

    /// Tree name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Tree configuration.
    pub fn config(&self) -> &CmdFsConfig {
        &self.config
    }

    /// Operation counters.
    pub fn stats(&self) -> &TreeStats {
        &self.stats
    }

    /// Returns the command `name` of environment `env`.
    pub fn cmd(&self, env: &str, name: &str) -> Option<Cmd> {
        self.root.env(env)?.cmd(name)
    }

    fn check(&self, node: &dyn Node, access: Access) -> Result<(), FsError> {
        let Some(who) = &self.who else {
            return Ok(());
        };
        let d = node.stat();
        let ok = match access {
            Access::Read => self.policy.can_read(&d, who),
            Access::Write => self.policy.can_write(&d, who),
            Access::Exec => self.policy.can_exec(&d, who),
        };
        if ok {
            Ok(())
        } else {
            debug!(path = %node.path(), uid = %who.uid, access = ?access, "denied");
            Err(FsError::Perm(node.path()))
        }
    }

    fn walk(&self, elems: &[&str]) -> Result<Arc<dyn Node>, FsError> {
        let mut node: Arc<dyn Node> = self.root.clone();
        for e in elems {
            if !node.caps().contains(Caps::WALK) {
                return Err(FsError::NotDir(node.path()));
            }
            self.check(node.as_ref(), Access::Exec)?;
            node = node.walk(e)?;
        }
        Ok(node)
    }

    /// Splits `path` into its parent node and the last element.
    fn walk_parent<'a>(&self, path: &'a str) -> Result<(Arc<dyn Node>, &'a str), FsError> {
        let elems = path_elems(path);
        let Some((name, parent)) = elems.split_last() else {
            return Err(FsError::Perm("/".to_string()));
        };
        Ok((self.walk(parent)?, *name))
    }

    fn stat_node(&self, node: &dyn Node, path: String) -> Dir {
        let mut d = node.stat();
        d.set("path", path);
        if self.root.all_virtual() {
            d.set("virtual", "y");
        }
        d
    }

    fn record<T>(&self, op: Op, res: &Result<T, FsError>, bytes: u64) {
        self.stats.record(op, res.is_ok(), bytes);
        if let Err(e) = res {
            debug!(op = op.name(), error = %e, "failed");
        }
    }

    /// Returns the attributes of `path`.
    pub fn stat(&self, path: &str) -> Result<Dir, FsError> {
        trace!(path, "stat");
        let res = self
            .walk(&path_elems(path))
            .map(|n| self.stat_node(n.as_ref(), clean_path(path)));
        self.record(Op::Stat, &res, 0);
        res
    }

    /// Lists the directory at `path`.
    pub fn getdir(&self, path: &str) -> Result<Vec<Dir>, FsError> {
        trace!(path, "getdir");
        let res = self.do_getdir(path);
        self.record(Op::Getdir, &res, 0);
        res
    }

    fn do_getdir(&self, path: &str) -> Result<Vec<Dir>, FsError> {
        let node = self.walk(&path_elems(path))?;
        if !node.caps().contains(Caps::GETDIR) {
            return Err(FsError::NotDir(node.path()));
        }
        self.check(node.as_ref(), Access::Read)?;
        let base = clean_path(path);
        let mut dirs = Vec::new();
        for name in node.getdir()? {
            let child = match node.walk(&name) {
                Ok(c) => c,
                Err(e) if e.is_not_exist() => continue,
                Err(e) => return Err(e),
            };
            let cpath = if base == "/" {
                format!("/{}", name)
            } else {
                format!("{}/{}", base, name)
            };
            dirs.push(self.stat_node(child.as_ref(), cpath));
        }
        Ok(dirs)
    }

    /// Sends the data of `path` from `off`, up to `count` bytes (`count < 0`
    /// for all of it). `out` is closed with the outcome. Returns the number
    /// of bytes sent.
    pub async fn get(&self, path: &str, off: u64, count: i64, out: Sender<Bytes>) -> Result<u64, FsError> {
        trace!(path, off, count, "get");
        let res = self.do_get(path, off, count, &out).await;
        match &res {
            Ok(_) => out.close(),
            Err(e) => out.close_with(Some(StreamError::new(e.to_string()))),
        }
        let n = *res.as_ref().unwrap_or(&0);
        self.record(Op::Get, &res, n);
        res
    }

    async fn do_get(&self, path: &str, off: u64, count: i64, out: &Sender<Bytes>) -> Result<u64, FsError> {
        let node = self.walk(&path_elems(path))?;
        if !node.caps().contains(Caps::GET) {
            if node.caps().contains(Caps::GETDIR) {
                return Err(FsError::IsDir(node.path()));
            }
            return Err(FsError::Perm(node.path()));
        }
        self.check(node.as_ref(), Access::Read)?;
        node.get(off, count, out).await
    }

    /// Stores the data received from `input` at `path`, creating the file
    /// if its directory allows that. Returns the number of bytes stored.
    pub async fn put(&self, path: &str, meta: &Dir, off: u64, input: Receiver<Bytes>) -> Result<u64, FsError> {
        trace!(path, off, "put");
        let res = self.do_put(path, meta, off, input).await;
        let n = *res.as_ref().unwrap_or(&0);
        self.record(Op::Put, &res, n);
        res
    }

    async fn do_put(&self, path: &str, meta: &Dir, off: u64, mut input: Receiver<Bytes>) -> Result<u64, FsError> {
        let target = match self.resolve_put(path) {
            Ok(t) => t,
            Err(e) => {
                input.close_with(Some(StreamError::new(e.to_string())));
                return Err(e);
            }
        };
        match target {
            (node, None) => node.put("", meta, off, input).await,
            (dir, Some(name)) => dir.put(name, meta, off, input).await,
        }
    }

    /// Finds the node to write: the file itself, or its directory and the
    /// name to create.
    fn resolve_put<'a>(&self, path: &'a str) -> Result<(Arc<dyn Node>, Option<&'a str>), FsError> {
        match self.walk(&path_elems(path)) {
            Ok(node) => {
                if !node.caps().contains(Caps::PUT) {
                    if node.caps().contains(Caps::GETDIR) {
                        return Err(FsError::IsDir(node.path()));
                    }
                    return Err(FsError::Perm(node.path()));
                }
                self.check(node.as_ref(), Access::Write)?;
                Ok((node, None))
            }
            Err(e) if e.is_not_exist() => {
                let (dir, name) = self.walk_parent(path)?;
                if !dir.caps().contains(Caps::PUT) {
                    return Err(e);
                }
                self.check(dir.as_ref(), Access::Write)?;
                Ok((dir, Some(name)))
            }
            Err(e) => Err(e),
        }
    }

    /// Creates the directory `path`.
    pub async fn mkdir(&self, path: &str, meta: &Dir) -> Result<(), FsError> {
        trace!(path, "mkdir");
        let res = async {
            let (dir, name) = self.walk_parent(path)?;
            if !dir.caps().contains(Caps::MKDIR) {
                return Err(FsError::Perm(clean_path(path)));
            }
            self.check(dir.as_ref(), Access::Write)?;
            dir.mkdir(name, meta).await
        }
        .await;
        self.record(Op::Mkdir, &res, 0);
        res
    }

    /// Removes `path`.
    pub async fn remove(&self, path: &str, all: bool) -> Result<(), FsError> {
        trace!(path, all, "remove");
        let res = async {
            let (dir, name) = self.walk_parent(path)?;
            if !dir.caps().contains(Caps::REMOVE) {
                return Err(FsError::Perm(clean_path(path)));
            }
            self.check(dir.as_ref(), Access::Write)?;
            dir.remove(name, all).await
        }
        .await;
        self.record(Op::Remove, &res, 0);
        res
    }

    /// Moves `from` to `to`.
    pub async fn mv(&self, from: &str, to: &str) -> Result<(), FsError> {
        trace!(from, to, "move");
        let res = async {
            let (src, name) = self.walk_parent(from)?;
            let (dst, new_name) = self.walk_parent(to)?;
            if !src.caps().contains(Caps::MOVE) {
                return Err(FsError::Perm(clean_path(from)));
            }
            self.check(src.as_ref(), Access::Write)?;
            self.check(dst.as_ref(), Access::Write)?;
            src.mv(name, dst, new_name).await
        }
        .await;
        self.record(Op::Move, &res, 0);
        res
    }

    /// Updates the attributes of `path`.
    pub async fn wstat(&self, path: &str, d: &Dir) -> Result<(), FsError> {
        trace!(path, "wstat");
        let res = async {
            let node = self.walk(&path_elems(path))?;
            if !node.caps().contains(Caps::WSTAT) {
                return Err(FsError::Perm(node.path()));
            }
            self.check(node.as_ref(), Access::Write)?;
            node.wstat(d).await
        }
        .await;
        self.record(Op::Wstat, &res, 0);
        res
    }

    /// Reads the whole file at `path`.
    pub async fn get_all(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let (tx, rx) = channel(GET_ALL_NBUF);
        let (res, (chunks, _)) = tokio::join!(self.get(path, 0, -1, tx), rx.drain());
        res?;
        Ok(chunks.concat())
    }

    /// Writes `data` as the whole content of `path`.
    pub async fn put_all(&self, path: &str, data: impl Into<Bytes>) -> Result<u64, FsError> {
        let input = preloaded(vec![data.into()]);
        self.put(path, &Dir::new(), 0, input).await
    }
}
