//! Using a remote command tree.

use bytes::Bytes;
use skein_core::{channel, preloaded, Receiver, Sender};
use skein_net::{dial, Conn, Mux, MuxConfig};
use skein_proto::{Codec, Dir, Msg};
use tracing::debug;

use crate::request::Request;
use crate::SrvError;

/// Queue size for data received by [`Client::get`].
const DATA_NBUF: usize = 16;

/// Issues file tree requests over a mux, one RPC stream per request.
#[derive(Clone)]
pub struct Client {
    mux: Mux,
}

impl Client {
    /// Creates a client on the caller side of `mux`.
    pub fn new(mux: Mux) -> Self {
        Self { mux }
    }

    /// Connects to a server at `addr`.
    pub async fn dial(addr: &str, config: MuxConfig, codec: Codec) -> Result<Self, SrvError> {
        let (mux, _incoming) = dial(addr, config, codec).await?;
        Ok(Self::new(mux))
    }

    /// Returns the underlying mux.
    pub fn mux(&self) -> &Mux {
        &self.mux
    }

    /// Closes the connection.
    pub fn close(&self) {
        self.mux.close();
    }

    async fn call(&self, req: &Request) -> Result<Conn, SrvError> {
        let conn = self.mux.rpc();
        debug!(tag = %conn.tag, op = req.op(), path = req.path(), "call");
        conn.send(req.to_dir()).await?;
        Ok(conn)
    }

    /// Sends a request with no data and collects the replies.
    async fn simple(&self, req: Request) -> Result<Vec<Msg>, SrvError> {
        let mut conn = self.call(&req).await?;
        conn.close_output(None);
        replies(conn).await
    }

    /// Returns the attributes of `path`.
    pub async fn stat(&self, path: &str) -> Result<Dir, SrvError> {
        let msgs = self.simple(Request::Stat { path: path.into() }).await?;
        match msgs.into_iter().next() {
            Some(Msg::Dir(d)) => Ok(d),
            other => Err(SrvError::Protocol(format!("stat {}: unexpected reply {:?}", path, other))),
        }
    }

    /// Lists the directory `path`.
    pub async fn getdir(&self, path: &str) -> Result<Vec<Dir>, SrvError> {
        let msgs = self.simple(Request::Getdir { path: path.into() }).await?;
        Ok(msgs
            .into_iter()
            .filter_map(|m| match m {
                Msg::Dir(d) => Some(d),
                _ => None,
            })
            .collect())
    }

    /// Streams the data of `path`. The returned queue is closed with the
    /// server's error, if any.
    pub async fn get(&self, path: &str, off: u64, count: i64) -> Result<Receiver<Bytes>, SrvError> {
        let mut conn = self
            .call(&Request::Get {
                path: path.into(),
                off,
                count,
            })
            .await?;
        conn.close_output(None);
        let (tx, rx) = channel(DATA_NBUF);
        tokio::spawn(forward_bytes(conn, tx));
        Ok(rx)
    }

    /// Reads the whole file `path`.
    pub async fn get_all(&self, path: &str) -> Result<Vec<u8>, SrvError> {
        let rx = self.get(path, 0, -1).await?;
        let (chunks, err) = rx.drain().await;
        match err {
            Some(e) => Err(SrvError::Remote(e)),
            None => Ok(chunks.concat()),
        }
    }

    /// Stores the data received from `data` at `path`.
    pub async fn put(&self, path: &str, meta: &Dir, off: u64, mut data: Receiver<Bytes>) -> Result<(), SrvError> {
        let req = Request::Put {
            path: path.into(),
            off,
            meta: meta.clone(),
        };
        let mut conn = self.call(&req).await?;
        while let Some(b) = data.recv().await {
            if conn.send(b).await.is_err() {
                // the reply carries the reason
                break;
            }
        }
        conn.close_output(data.error());
        replies(conn).await.map(|_| ())
    }

    /// Writes `data` as the whole content of `path`.
    pub async fn put_all(&self, path: &str, data: impl Into<Bytes>) -> Result<(), SrvError> {
        self.put(path, &Dir::new(), 0, preloaded(vec![data.into()])).await
    }

    /// Creates the directory `path`.
    pub async fn mkdir(&self, path: &str, meta: &Dir) -> Result<(), SrvError> {
        self.simple(Request::Mkdir {
            path: path.into(),
            meta: meta.clone(),
        })
        .await
        .map(|_| ())
    }

    /// Removes `path`.
    pub async fn remove(&self, path: &str, all: bool) -> Result<(), SrvError> {
        self.simple(Request::Remove {
            path: path.into(),
            all,
        })
        .await
        .map(|_| ())
    }

    /// Moves `from` to `to`.
    pub async fn mv(&self, from: &str, to: &str) -> Result<(), SrvError> {
        self.simple(Request::Move {
            path: from.into(),
            new_path: to.into(),
        })
        .await
        .map(|_| ())
    }

    /// Updates the attributes of `path`.
    pub async fn wstat(&self, path: &str, meta: &Dir) -> Result<(), SrvError> {
        self.simple(Request::Wstat {
            path: path.into(),
            meta: meta.clone(),
        })
        .await
        .map(|_| ())
    }
}

/// Collects every reply, failing with the error the stream closed with.
async fn replies(mut conn: Conn) -> Result<Vec<Msg>, SrvError> {
    let mut msgs = Vec::new();
    while let Some(m) = conn.recv().await {
        msgs.push(m);
    }
    match conn.input.as_ref().and_then(|i| i.error()) {
        Some(e) => Err(SrvError::Remote(e)),
        None => Ok(msgs),
    }
}

async fn forward_bytes(mut conn: Conn, tx: Sender<Bytes>) {
    while let Some(m) = conn.recv().await {
        match m {
            Msg::Bytes(b) => {
                if let Err(e) = tx.send(b).await {
                    conn.close_input(Some(e));
                    return;
                }
            }
            Msg::Err(e) => {
                tx.close_with(Some(e));
                return;
            }
            _ => {}
        }
    }
    tx.close_with(conn.input.as_ref().and_then(|i| i.error()));
}
