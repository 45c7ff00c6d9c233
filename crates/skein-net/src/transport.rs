//! TCP transport for multiplexed connections.

use std::net::SocketAddr;

use skein_core::Receiver;
use skein_proto::Codec;
use thiserror::Error;
use tracing::{debug, info};

use crate::conn::Conn;
use crate::mux::{Mux, MuxConfig};

/// Transport errors.
#[derive(Debug, Error)]
pub enum NetError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connects to `addr` and starts a caller-side mux on the connection.
pub async fn dial(addr: &str, config: MuxConfig, codec: Codec) -> Result<(Mux, Receiver<Conn>), NetError> {
    let stream = tokio::net::TcpStream::connect(addr)
        .await
        .map_err(|e| NetError::ConnectionFailed(format!("{}: {}", addr, e)))?;
    stream.set_nodelay(true)?;
    debug!(addr = addr, "dialed");
    Ok(Mux::new(stream, true, config, codec))
}

/// Accepts TCP connections, each becoming a callee-side mux.
pub struct TcpListener {
    inner: tokio::net::TcpListener,
    config: MuxConfig,
    codec: Codec,
}

impl TcpListener {
    /// Binds to `addr`.
    pub async fn bind(addr: &str, config: MuxConfig, codec: Codec) -> Result<Self, NetError> {
        let inner = tokio::net::TcpListener::bind(addr).await?;
        info!(addr = %inner.local_addr()?, "listening");
        Ok(Self {
            inner,
            config,
            codec,
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.inner.local_addr()?)
    }

    /// Waits for the next connection.
    pub async fn accept(&self) -> Result<(Mux, Receiver<Conn>, SocketAddr), NetError> {
        let (stream, peer) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        let config = MuxConfig {
            label: format!("{}!{}", self.config.label, peer),
            ..self.config.clone()
        };
        let (mux, incoming) = Mux::new(stream, false, config, self.codec.clone());
        debug!(peer = %peer, "accepted");
        Ok((mux, incoming, peer))
    }
}
