//! Environments: variables, a working directory and a set of commands.
//!
//! Each environment owns a worker task. Every change to the variables or
//! the working directory seen by new processes, and every process start,
//! goes through the worker so they apply in order.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use skein_core::{Receiver, Sender};
use skein_proto::Dir;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::cmd::Cmd;
use crate::config::CmdFsConfig;
use crate::error::FsError;
use crate::interp::{Child, Interp, Job};
use crate::node::{attrs, read_string, send_slice, Caps, Node};

/// Name of the variables directory inside an environment.
pub const VARS_NAME: &str = "vars";

/// Variable holding the working directory.
pub const DOT_VAR: &str = "dot";

const WORKER_QUEUE: usize = 32;

fn is_dot(name: &str) -> bool {
    name == DOT_VAR || name == "cwd"
}

/// Requests served by an environment's worker.
#[derive(Debug)]
pub(crate) enum EnvCommand {
    /// Set a variable; `dot` changes the working directory
    SetVar(String, String),
    /// Unset a variable
    UnsetVar(String),
    /// Start a command
    Spawn {
        script: String,
        stdin: Option<Receiver<Bytes>>,
        stdout: Sender<Bytes>,
        stderr: Sender<Bytes>,
        reply: oneshot::Sender<Result<Child, FsError>>,
    },
}

/// Handle to an environment's worker.
#[derive(Clone)]
pub(crate) struct Worker {
    path: String,
    tx: Arc<Mutex<Option<mpsc::Sender<EnvCommand>>>>,
}

impl Worker {
    fn start(path: String, vars: BTreeMap<String, String>, cwd: PathBuf, interp: Arc<dyn Interp>) -> Self {
        let (tx, rx) = mpsc::channel(WORKER_QUEUE);
        let mut worker = EnvWorker {
            path: path.clone(),
            vars,
            cwd,
            interp,
        };
        worker.vars.retain(|k, _| !is_dot(k));
        tokio::spawn(worker.run(rx));
        Self {
            path,
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    pub(crate) async fn send(&self, cmd: EnvCommand) -> Result<(), FsError> {
        let tx = self.tx.lock().clone();
        let tx = tx.ok_or_else(|| FsError::NotExist(self.path.clone()))?;
        tx.send(cmd)
            .await
            .map_err(|_| FsError::NotExist(self.path.clone()))
    }

    /// Stops the worker once queued requests are done.
    fn close(&self) {
        self.tx.lock().take();
    }
}

/// The worker's view of the environment, applied to new processes.
struct EnvWorker {
    path: String,
    vars: BTreeMap<String, String>,
    cwd: PathBuf,
    interp: Arc<dyn Interp>,
}

impl EnvWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<EnvCommand>) {
        debug!(env = %self.path, cwd = %self.cwd.display(), "env worker started");
        while let Some(cmd) = rx.recv().await {
            match cmd {
                EnvCommand::SetVar(name, value) if is_dot(&name) => {
                    self.cwd = PathBuf::from(value);
                    debug!(env = %self.path, cwd = %self.cwd.display(), "new dot");
                }
                EnvCommand::SetVar(name, value) => {
                    self.vars.insert(name, value);
                }
                EnvCommand::UnsetVar(name) => {
                    self.vars.remove(&name);
                }
                EnvCommand::Spawn {
                    script,
                    stdin,
                    stdout,
                    stderr,
                    reply,
                } => {
                    let job = Job {
                        script,
                        vars: self.vars.clone(),
                        cwd: self.cwd.clone(),
                        stdin,
                        stdout,
                        stderr,
                    };
                    let _ = reply.send(self.interp.spawn(job).await);
                }
            }
        }
        debug!(env = %self.path, "env worker done");
    }
}

struct EnvInner {
    name: String,
    path: String,
    config: Arc<CmdFsConfig>,
    vars: Arc<VarsInner>,
    cmds: Mutex<BTreeMap<String, Cmd>>,
    worker: Worker,
}

/// An environment directory. Clones share the environment.
#[derive(Clone)]
pub struct Env {
    inner: Arc<EnvInner>,
}

impl Env {
    /// Creates an environment seeded with the host's variables and the
    /// configured working directory, and starts its worker.
    pub(crate) fn new(name: &str, config: Arc<CmdFsConfig>, interp: Arc<dyn Interp>) -> Self {
        let path = format!("/{}", name);
        let cwd = config.initial_cwd();
        let mut vars: BTreeMap<String, String> = std::env::vars().collect();
        vars.insert(DOT_VAR.to_string(), cwd.display().to_string());

        let worker = Worker::start(path.clone(), vars.clone(), cwd, interp);
        Self {
            inner: Arc::new(EnvInner {
                name: name.to_string(),
                vars: Arc::new(VarsInner {
                    path: format!("{}/{}", path, VARS_NAME),
                    owner: config.owner.clone(),
                    chunk: config.chunk_size,
                    vars: Mutex::new(vars),
                    worker: worker.clone(),
                }),
                path,
                config,
                cmds: Mutex::new(BTreeMap::new()),
                worker,
            }),
        }
    }

    /// Environment name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the command named `name`.
    pub fn cmd(&self, name: &str) -> Option<Cmd> {
        self.inner.cmds.lock().get(name).cloned()
    }

    /// Called once the environment is removed from the tree: stops the
    /// worker and kills every command.
    pub(crate) fn removed(&self) {
        self.inner.worker.close();
        let cmds = std::mem::take(&mut *self.inner.cmds.lock());
        info!(env = %self.inner.path, cmds = cmds.len(), "environment removed");
        for cmd in cmds.values() {
            cmd.removed();
        }
    }
}

#[async_trait]
impl Node for Env {
    fn path(&self) -> String {
        self.inner.path.clone()
    }

    fn stat(&self) -> Dir {
        let n = self.inner.cmds.lock().len() as u64 + 1;
        attrs(&self.inner.name, "d", 0o755, n, &self.inner.config.owner)
    }

    fn caps(&self) -> Caps {
        Caps::WALK | Caps::GETDIR | Caps::MKDIR | Caps::REMOVE
    }

    fn walk(&self, name: &str) -> Result<Arc<dyn Node>, FsError> {
        if name == VARS_NAME {
            return Ok(Arc::new(Vars {
                inner: self.inner.vars.clone(),
            }));
        }
        match self.inner.cmds.lock().get(name) {
            Some(c) => Ok(Arc::new(c.clone())),
            None => Err(FsError::NotExist(format!("{}/{}", self.inner.path, name))),
        }
    }

    fn getdir(&self) -> Result<Vec<String>, FsError> {
        let mut names = vec![VARS_NAME.to_string()];
        names.extend(self.inner.cmds.lock().keys().cloned());
        Ok(names)
    }

    async fn mkdir(&self, name: &str, _meta: &Dir) -> Result<(), FsError> {
        let path = format!("{}/{}", self.inner.path, name);
        if name == VARS_NAME {
            return Err(FsError::Exists(path));
        }
        let mut cmds = self.inner.cmds.lock();
        if cmds.contains_key(name) {
            return Err(FsError::Exists(path));
        }
        let cmd = Cmd::new(
            &self.inner.path,
            name,
            self.inner.config.clone(),
            self.inner.worker.clone(),
        );
        cmds.insert(name.to_string(), cmd);
        debug!(path = %path, "new command");
        Ok(())
    }

    async fn remove(&self, name: &str, _all: bool) -> Result<(), FsError> {
        let path = format!("{}/{}", self.inner.path, name);
        if name == VARS_NAME {
            return Err(FsError::Perm(path));
        }
        let cmd = self.inner.cmds.lock().remove(name);
        match cmd {
            Some(cmd) => {
                debug!(path = %path, "command removed");
                cmd.removed();
                Ok(())
            }
            None => Err(FsError::NotExist(path)),
        }
    }
}

struct VarsInner {
    path: String,
    owner: String,
    chunk: usize,
    vars: Mutex<BTreeMap<String, String>>,
    worker: Worker,
}

impl VarsInner {
    async fn set(&self, name: &str, input: Receiver<Bytes>) -> Result<u64, FsError> {
        let path = format!("{}/{}", self.path, name);
        let (value, n) = read_string(&path, input).await?;
        let value = {
            let mut vars = self.vars.lock();
            let value = if is_dot(name) {
                // Relative to the current directory; stored resolved.
                let cwd = vars.get(DOT_VAR).map(PathBuf::from).unwrap_or_default();
                let dot = cwd.join(value.trim()).display().to_string();
                vars.insert(DOT_VAR.to_string(), dot.clone());
                dot
            } else {
                value
            };
            vars.insert(name.to_string(), value.clone());
            value
        };
        self.worker
            .send(EnvCommand::SetVar(name.to_string(), value))
            .await?;
        Ok(n)
    }
}

/// The `vars` directory of an environment.
struct Vars {
    inner: Arc<VarsInner>,
}

#[async_trait]
impl Node for Vars {
    fn path(&self) -> String {
        self.inner.path.clone()
    }

    fn stat(&self) -> Dir {
        let n = self.inner.vars.lock().len() as u64;
        attrs(VARS_NAME, "d", 0o755, n, &self.inner.owner)
    }

    fn caps(&self) -> Caps {
        Caps::WALK | Caps::GETDIR | Caps::PUT | Caps::REMOVE
    }

    fn walk(&self, name: &str) -> Result<Arc<dyn Node>, FsError> {
        if !self.inner.vars.lock().contains_key(name) {
            return Err(FsError::NotExist(format!("{}/{}", self.inner.path, name)));
        }
        Ok(Arc::new(Var {
            vars: self.inner.clone(),
            name: name.to_string(),
        }))
    }

    fn getdir(&self) -> Result<Vec<String>, FsError> {
        Ok(self.inner.vars.lock().keys().cloned().collect())
    }

    async fn put(&self, name: &str, _meta: &Dir, _off: u64, input: Receiver<Bytes>) -> Result<u64, FsError> {
        if name.is_empty() {
            return Err(FsError::IsDir(self.inner.path.clone()));
        }
        self.inner.set(name, input).await
    }

    async fn remove(&self, name: &str, _all: bool) -> Result<(), FsError> {
        let old = self.inner.vars.lock().remove(name);
        if old.is_none() {
            return Err(FsError::NotExist(format!("{}/{}", self.inner.path, name)));
        }
        self.inner
            .worker
            .send(EnvCommand::UnsetVar(name.to_string()))
            .await
    }
}

/// One variable; its contents are the value.
struct Var {
    vars: Arc<VarsInner>,
    name: String,
}

#[async_trait]
impl Node for Var {
    fn path(&self) -> String {
        format!("{}/{}", self.vars.path, self.name)
    }

    fn stat(&self) -> Dir {
        let n = self
            .vars
            .vars
            .lock()
            .get(&self.name)
            .map_or(0, String::len);
        attrs(&self.name, "-", 0o644, n as u64, &self.vars.owner)
    }

    fn caps(&self) -> Caps {
        Caps::GET | Caps::PUT
    }

    async fn get(&self, off: u64, count: i64, out: &Sender<Bytes>) -> Result<u64, FsError> {
        let value = self.vars.vars.lock().get(&self.name).cloned().unwrap_or_default();
        send_slice(value.as_bytes(), off, count, self.vars.chunk, out).await
    }

    async fn put(&self, _name: &str, _meta: &Dir, _off: u64, input: Receiver<Bytes>) -> Result<u64, FsError> {
        self.vars.set(&self.name, input).await
    }
}

#[cfg(test)]
mod tests {
    use skein_proto::Dir;

    use crate::{CmdFsConfig, Tree};

    async fn setup() -> (Tree, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = CmdFsConfig {
            cwd: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let tree = Tree::new(config);
        tree.mkdir("/e0", &Dir::new()).await.unwrap();
        (tree, dir)
    }

    async fn run(tree: &Tree, cmd: &str, script: &str) -> String {
        tree.mkdir(&format!("/e0/{}", cmd), &Dir::new()).await.unwrap();
        tree.put_all(&format!("/e0/{}/cmd", cmd), script.to_string())
            .await
            .unwrap();
        let sts = tree.get_all(&format!("/e0/{}/wait", cmd)).await.unwrap();
        assert_eq!(sts, b"success\n");
        let out = tree.get_all(&format!("/e0/{}/out", cmd)).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn test_env_listing() {
        let (tree, dir) = setup().await;
        assert!(tree.stat("/e0").unwrap().is_dir());
        assert_eq!(tree.stat("/e0").unwrap().size(), 1);
        tree.mkdir("/e0/c0", &Dir::new()).await.unwrap();
        let names: Vec<_> = tree
            .getdir("/e0")
            .unwrap()
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(names, vec!["vars", "c0"]);

        let dot = tree.get_all("/e0/vars/dot").await.unwrap();
        assert_eq!(String::from_utf8(dot).unwrap(), dir.path().display().to_string());

        let err = tree.mkdir("/e0/c0", &Dir::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "/e0/c0: file already exists");
        assert!(tree.mkdir("/e0/vars", &Dir::new()).await.is_err());
        assert!(tree.remove("/e0/vars", false).await.unwrap_err().is_perm());
        assert!(tree.remove("/e0/nope", false).await.unwrap_err().is_not_exist());
    }

    #[tokio::test]
    async fn test_vars_reach_commands() {
        let (tree, _dir) = setup().await;
        tree.put_all("/e0/vars/SKEIN_GREETING", "hola").await.unwrap();
        assert_eq!(tree.get_all("/e0/vars/SKEIN_GREETING").await.unwrap(), b"hola");
        assert_eq!(run(&tree, "c0", "echo $SKEIN_GREETING").await, "hola\n");

        tree.put_all("/e0/vars/SKEIN_GREETING", "adios").await.unwrap();
        assert_eq!(run(&tree, "c1", "echo $SKEIN_GREETING").await, "adios\n");

        tree.remove("/e0/vars/SKEIN_GREETING", false).await.unwrap();
        assert!(tree.stat("/e0/vars/SKEIN_GREETING").unwrap_err().is_not_exist());
        assert_eq!(run(&tree, "c2", "echo \"[$SKEIN_GREETING]\"").await, "[]\n");
    }

    #[tokio::test]
    async fn test_dot_is_the_cwd() {
        let (tree, dir) = setup().await;
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        assert_eq!(
            run(&tree, "c0", "pwd").await.trim_end(),
            dir.path().canonicalize().unwrap().display().to_string()
        );
        tree.put_all("/e0/vars/dot", "sub").await.unwrap();
        let pwd = run(&tree, "c1", "pwd").await;
        assert!(pwd.trim_end().ends_with("/sub"));

        // reads back the resolved directory; writing it again stays put
        let sub = dir.path().join("sub").display().to_string();
        let dot = tree.get_all("/e0/vars/dot").await.unwrap();
        assert_eq!(String::from_utf8(dot).unwrap(), sub);
        tree.put_all("/e0/vars/dot", sub.clone()).await.unwrap();
        let pwd = run(&tree, "c2", "pwd").await;
        assert!(pwd.trim_end().ends_with("/sub"));
        assert!(!pwd.trim_end().ends_with("/sub/sub"));
    }

    #[tokio::test]
    async fn test_vars_dir_errors() {
        let (tree, _dir) = setup().await;
        let err = tree.put_all("/e0/vars", "x").await.unwrap_err();
        assert_eq!(err.to_string(), "/e0/vars: is a directory");
        assert!(tree.put_all("/e0/nope/x", "y").await.unwrap_err().is_not_exist());
    }

    #[tokio::test]
    async fn test_remove_env() {
        let (tree, _dir) = setup().await;
        tree.mkdir("/e0/c0", &Dir::new()).await.unwrap();
        tree.put_all("/e0/c0/cmd", "sleep 30").await.unwrap();
        let cmd = tree.cmd("e0", "c0").unwrap();

        tree.remove("/e0", true).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), cmd.wait())
            .await
            .unwrap();
        assert!(tree.stat("/e0").unwrap_err().is_not_exist());
        assert!(tree.cmd("e0", "c0").is_none());

        // a fresh env with the same name starts empty
        tree.mkdir("/e0", &Dir::new()).await.unwrap();
        assert_eq!(tree.getdir("/e0").unwrap().len(), 1);
    }
}
