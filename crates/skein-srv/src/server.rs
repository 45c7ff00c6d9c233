//! Serving a command tree to a peer.

use bytes::Bytes;
use skein_cmdfs::Tree;
use skein_core::{channel, Receiver, StreamError};
use skein_net::Conn;
use skein_proto::Msg;
use tracing::{debug, info, trace};

use crate::request::Request;
use crate::SrvError;

/// Queue size between the tree and a reply stream.
const DATA_NBUF: usize = 16;

/// Serves file tree requests, one per incoming RPC stream.
#[derive(Clone)]
pub struct Server {
    tree: Tree,
}

impl Server {
    /// Creates a server for `tree`.
    pub fn new(tree: Tree) -> Self {
        Self { tree }
    }

    /// Returns the served tree.
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Serves the streams the peer opens until it stops opening them.
    pub async fn serve(&self, mut incoming: Receiver<Conn>) {
        info!(tree = %self.tree.name(), "serving");
        while let Some(conn) = incoming.recv().await {
            let tree = self.tree.clone();
            tokio::spawn(async move {
                serve_conn(&tree, conn).await;
            });
        }
        debug!(tree = %self.tree.name(), error = ?incoming.error(), "no more streams");
    }
}

/// Handles the single request carried by `conn`.
pub async fn serve_conn(tree: &Tree, mut conn: Conn) {
    let req = match conn.recv().await {
        Some(Msg::Dir(d)) => Request::from_dir(&d),
        Some(other) => Err(SrvError::BadRequest(format!("not a request: {:?}", other.kind()))),
        None => return,
    };
    let res = match req {
        Ok(req) => {
            trace!(tag = %conn.tag, op = req.op(), path = req.path(), "request");
            handle(tree, req, &mut conn).await
        }
        Err(e) => Err(e),
    };
    match res {
        Ok(()) => conn.close_output(None),
        Err(e) => {
            debug!(tag = %conn.tag, error = %e, "request failed");
            conn.close_output(Some(StreamError::new(e.to_string())));
        }
    }
    conn.close_input(None);
}

async fn handle(tree: &Tree, req: Request, conn: &mut Conn) -> Result<(), SrvError> {
    match req {
        Request::Stat { path } => {
            let d = tree.stat(&path)?;
            conn.send(d).await?;
        }
        Request::Getdir { path } => {
            for d in tree.getdir(&path)? {
                conn.send(d).await?;
            }
        }
        Request::Get { path, off, count } => {
            let output = conn
                .output
                .clone()
                .ok_or_else(|| SrvError::Protocol("get without a reply stream".to_string()))?;
            let (tx, mut rx) = channel::<Bytes>(DATA_NBUF);
            let forward = async move {
                while let Some(b) = rx.recv().await {
                    if let Err(e) = output.send(Msg::Bytes(b)).await {
                        rx.close_with(Some(e));
                        break;
                    }
                }
            };
            let (res, ()) = tokio::join!(tree.get(&path, off, count, tx), forward);
            res?;
        }
        Request::Put { path, off, meta } => {
            let mut input = conn
                .input
                .take()
                .ok_or_else(|| SrvError::Protocol("put without data".to_string()))?;
            let (tx, rx) = channel::<Bytes>(DATA_NBUF);
            let forward = async move {
                while let Some(m) = input.recv().await {
                    if let Msg::Bytes(b) = m {
                        if tx.send(b).await.is_err() {
                            return;
                        }
                    }
                }
                tx.close_with(input.error());
            };
            let (res, ()) = tokio::join!(tree.put(&path, &meta, off, rx), forward);
            res?;
        }
        Request::Mkdir { path, meta } => tree.mkdir(&path, &meta).await?,
        Request::Remove { path, all } => tree.remove(&path, all).await?,
        Request::Move { path, new_path } => tree.mv(&path, &new_path).await?,
        Request::Wstat { path, meta } => tree.wstat(&path, &meta).await?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use skein_cmdfs::{CmdFsConfig, Tree};
    use skein_net::{Mux, MuxConfig};
    use skein_proto::{Codec, Dir};

    use super::*;
    use crate::Client;

    fn setup() -> (Client, Tree) {
        let config = CmdFsConfig {
            cwd: Some(std::env::temp_dir()),
            ..Default::default()
        };
        let tree = Tree::new(config);
        let ((_callee, incoming), (caller, _)) = Mux::pair(MuxConfig::new("rpc"), Codec::default());
        let server = Server::new(tree.clone());
        tokio::spawn(async move { server.serve(incoming).await });
        (Client::new(caller), tree)
    }

    #[tokio::test]
    async fn test_stat_and_getdir() {
        let (client, _tree) = setup();
        client.mkdir("/e0", &Dir::new()).await.unwrap();
        client.mkdir("/e0/c0", &Dir::new()).await.unwrap();

        let d = client.stat("/e0/c0").await.unwrap();
        assert!(d.is_dir());
        assert_eq!(d.path(), "/e0/c0");

        let names: Vec<_> = client
            .getdir("/e0")
            .await
            .unwrap()
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(names, vec!["vars", "c0"]);
    }

    #[tokio::test]
    async fn test_errors_cross_the_wire() {
        let (client, _tree) = setup();
        let err = client.stat("/nope").await.unwrap_err();
        assert_eq!(err.remote_message(), Some("/nope: file does not exist"));

        client.mkdir("/e0", &Dir::new()).await.unwrap();
        let err = client.mkdir("/e0", &Dir::new()).await.unwrap_err();
        assert_eq!(err.remote_message(), Some("/e0: file already exists"));

        let err = client.get_all("/e0").await.unwrap_err();
        assert_eq!(err.remote_message(), Some("/e0: is a directory"));
    }

    #[tokio::test]
    async fn test_run_command() {
        let (client, tree) = setup();
        client.mkdir("/e0", &Dir::new()).await.unwrap();
        client.mkdir("/e0/c0", &Dir::new()).await.unwrap();
        client.put_all("/e0/c0/in", "over the wire\n").await.unwrap();
        client.put_all("/e0/c0/cmd", "tr a-z A-Z").await.unwrap();
        assert_eq!(client.get_all("/e0/c0/wait").await.unwrap(), b"success\n");
        assert_eq!(client.get_all("/e0/c0/out").await.unwrap(), b"OVER THE WIRE\n");
        assert_eq!(client.get_all("/e0/c0/pout").await.unwrap(), b"OVER THE WIRE\n");

        let err = client.put_all("/e0/c0/cmd", "true").await.unwrap_err();
        assert_eq!(err.remote_message(), Some("/e0/c0: one cmd is enough"));

        client.remove("/e0/c0", false).await.unwrap();
        assert!(tree.cmd("e0", "c0").is_none());
    }

    #[tokio::test]
    async fn test_get_range() {
        let (client, _tree) = setup();
        client.mkdir("/e0", &Dir::new()).await.unwrap();
        client.put_all("/e0/vars/LETTERS", "abcdefgh").await.unwrap();
        let rx = client.get("/e0/vars/LETTERS", 2, 3).await.unwrap();
        let (chunks, err) = rx.drain().await;
        assert!(err.is_none());
        assert_eq!(chunks.concat(), b"cde");
    }

    #[tokio::test]
    async fn test_bad_request() {
        let (client, _tree) = setup();
        let mut conn = client.mux().rpc();
        conn.send(Dir::new().with("op", "chmod").with("path", "/")).await.unwrap();
        conn.close_output(None);
        assert_eq!(conn.recv().await, None);
        let err = conn.input.as_ref().unwrap().error().unwrap();
        assert_eq!(err.message(), "bad request: unknown op 'chmod'");
    }
}
