//! Test server harness.
//!
//! A [`TestServer`] owns a command tree working in a temporary directory,
//! a server for it and a client talking to the server through a mux.

use std::path::Path;

use skein_cmdfs::{CmdFsConfig, Tree};
use skein_net::{Mux, MuxConfig, TcpListener};
use skein_proto::{Codec, Dir};
use skein_srv::{Client, Server, SrvError};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::{debug, info};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A served command tree plus a client for it.
pub struct TestServer {
    /// The served tree, for direct inspection
    pub tree: Tree,
    /// Client connected to the server
    pub client: Client,
    /// Working directory of new environments
    workdir: TempDir,
    /// Listening address, when serving over TCP
    addr: Option<String>,
    /// Accept loop, when serving over TCP
    acceptor: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Configuration used for test trees: commands start in `workdir` and
    /// restarts do not linger.
    pub fn config(workdir: &Path) -> CmdFsConfig {
        CmdFsConfig {
            name: "test".to_string(),
            cwd: Some(workdir.to_path_buf()),
            restart_grace_ms: 20,
            ..Default::default()
        }
    }

    /// Serves a fresh tree over an in-memory mux pair.
    pub fn in_memory() -> Result<Self, BoxError> {
        let workdir = TempDir::new()?;
        let tree = Tree::new(Self::config(workdir.path()));
        let ((_callee, incoming), (caller, _)) = Mux::pair(MuxConfig::new("test"), Codec::default());
        let server = Server::new(tree.clone());
        tokio::spawn(async move { server.serve(incoming).await });
        debug!(workdir = %workdir.path().display(), "in-memory test server");
        Ok(Self {
            tree,
            client: Client::new(caller),
            workdir,
            addr: None,
            acceptor: None,
        })
    }

    /// Serves a fresh tree on a loopback TCP port.
    pub async fn over_tcp() -> Result<Self, BoxError> {
        let workdir = TempDir::new()?;
        let tree = Tree::new(Self::config(workdir.path()));
        let listener = TcpListener::bind("127.0.0.1:0", MuxConfig::new("srv"), Codec::default()).await?;
        let addr = listener.local_addr()?.to_string();

        let server = Server::new(tree.clone());
        let acceptor = tokio::spawn(async move {
            while let Ok((_mux, incoming, peer)) = listener.accept().await {
                debug!(peer = %peer, "test server accepted");
                let server = server.clone();
                tokio::spawn(async move { server.serve(incoming).await });
            }
        });

        let client = Client::dial(&addr, MuxConfig::new("cli"), Codec::default()).await?;
        info!(addr = %addr, "tcp test server");

        Ok(Self {
            tree,
            client,
            workdir,
            addr: Some(addr),
            acceptor: Some(acceptor),
        })
    }

    /// Address to dial for more clients, when serving over TCP.
    pub fn local_addr(&self) -> Option<String> {
        self.addr.clone()
    }

    /// Working directory commands start in.
    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }

    /// Creates `/<env>/<cmd>`, creating the environment if needed, and
    /// returns the command's path.
    pub async fn mkcmd(&self, env: &str, cmd: &str) -> Result<String, SrvError> {
        let env_path = format!("/{}", env);
        if self.client.stat(&env_path).await.is_err() {
            self.client.mkdir(&env_path, &Dir::new()).await?;
        }
        let path = format!("{}/{}", env_path, cmd);
        self.client.mkdir(&path, &Dir::new()).await?;
        Ok(path)
    }

    /// Creates a command and starts `script` in it. Returns the command's path.
    pub async fn run(&self, env: &str, cmd: &str, script: &str) -> Result<String, SrvError> {
        let path = self.mkcmd(env, cmd).await?;
        self.client.put_all(&format!("{}/cmd", path), script.to_string()).await?;
        Ok(path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.client.close();
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.abort();
        }
    }
}
