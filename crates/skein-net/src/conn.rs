//! Duplex message connections.

use skein_core::{channel, Receiver, Sender, StreamError};
use skein_proto::{read_msgs, write_msgs, Codec, Msg};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::debug;

/// Buffer size of the in-process pipes used by [`Conn::pipe_pair`].
const PIPE_SIZE: usize = 64 * 1024;

/// A pair of message queues.
///
/// `input` carries messages from the peer; `output` carries messages to
/// it. Either may be missing, e.g. for a mux stream with no reply.
#[derive(Debug)]
pub struct Conn {
    /// Diagnostic tag
    pub tag: String,
    /// Incoming messages
    pub input: Option<Receiver<Msg>>,
    /// Outgoing messages
    pub output: Option<Sender<Msg>>,
}

impl Conn {
    /// Creates a connection from raw queue ends.
    pub fn new(tag: impl Into<String>, input: Option<Receiver<Msg>>, output: Option<Sender<Msg>>) -> Self {
        Self {
            tag: tag.into(),
            input,
            output,
        }
    }

    /// Wraps a byte device, spawning its reader and writer tasks.
    pub fn open<D>(tag: impl Into<String>, device: D, nbuf: usize, codec: Codec) -> Self
    where
        D: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::open_with_hup(tag, device, nbuf, codec).0
    }

    /// Like [`Conn::open`], also returning a hang-up signal.
    ///
    /// The signal resolves once both the reader and the writer are done
    /// and the device has been released.
    pub fn open_with_hup<D>(
        tag: impl Into<String>,
        device: D,
        nbuf: usize,
        codec: Codec,
    ) -> (Self, oneshot::Receiver<()>)
    where
        D: AsyncRead + AsyncWrite + Send + 'static,
    {
        let tag = tag.into();
        let (mut rd, mut wr) = tokio::io::split(device);
        let (in_tx, in_rx) = channel::<Msg>(nbuf);
        let (out_tx, mut out_rx) = channel::<Msg>(nbuf);
        let (hup_tx, hup_rx) = oneshot::channel();

        let rtag = tag.clone();
        let rcodec = codec.clone();
        let reader = tokio::spawn(async move {
            let res = read_msgs(&rcodec, &mut rd, &in_tx).await;
            let err = res.as_ref().err().map(|e| StreamError::from(e.to_string()));
            debug!(tag = %rtag, ?res, "conn reader done");
            in_tx.close_with(err);
            drop(rd);
        });

        let wtag = tag.clone();
        let writer = tokio::spawn(async move {
            let res = write_msgs(&codec, &mut wr, 0, &mut out_rx).await;
            if let Err(e) = &res {
                out_rx.close_with(Some(StreamError::new(e.to_string())));
            }
            let _ = wr.shutdown().await;
            debug!(tag = %wtag, ?res, "conn writer done");
        });

        let jtag = tag.clone();
        tokio::spawn(async move {
            let _ = reader.await;
            let _ = writer.await;
            debug!(tag = %jtag, "conn hangup");
            let _ = hup_tx.send(());
        });

        (
            Self {
                tag,
                input: Some(in_rx),
                output: Some(out_tx),
            },
            hup_rx,
        )
    }

    /// Returns two connections wired to each other through in-memory pipes.
    pub fn pipe_pair(nbuf: usize, codec: Codec) -> (Conn, Conn) {
        let (a, b) = tokio::io::duplex(PIPE_SIZE);
        (
            Conn::open("pipe1", a, nbuf, codec.clone()),
            Conn::open("pipe2", b, nbuf, codec),
        )
    }

    /// Sends a message on the output queue.
    pub async fn send(&self, msg: impl Into<Msg>) -> Result<(), StreamError> {
        match &self.output {
            Some(tx) => tx.send(msg.into()).await,
            None => Err(StreamError::new("no output")),
        }
    }

    /// Receives a message from the input queue.
    pub async fn recv(&mut self) -> Option<Msg> {
        match &mut self.input {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Closes the output queue, optionally with an error.
    pub fn close_output(&mut self, err: Option<StreamError>) {
        if let Some(tx) = self.output.take() {
            tx.close_with(err);
        }
    }

    /// Closes the input queue, optionally with an error.
    pub fn close_input(&mut self, err: Option<StreamError>) {
        if let Some(mut rx) = self.input.take() {
            rx.close_with(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pipe_pair_both_ways() {
        let (mut a, mut b) = Conn::pipe_pair(8, Codec::default());
        a.send("ping").await.unwrap();
        assert_eq!(b.recv().await, Some(Msg::from("ping")));
        b.send(&b"pong"[..]).await.unwrap();
        assert_eq!(a.recv().await, Some(Msg::from(&b"pong"[..])));
    }

    #[tokio::test]
    async fn test_half_close() {
        let (mut a, mut b) = Conn::pipe_pair(8, Codec::default());
        a.send("last").await.unwrap();
        a.close_output(None);

        assert_eq!(b.recv().await, Some(Msg::from("last")));
        assert_eq!(b.recv().await, None);
        assert!(b.input.as_ref().unwrap().error().is_none());

        // The other direction still works.
        b.send("reply").await.unwrap();
        assert_eq!(a.recv().await, Some(Msg::from("reply")));
    }

    #[tokio::test]
    async fn test_close_error_becomes_msg() {
        let (mut a, mut b) = Conn::pipe_pair(8, Codec::default());
        a.close_output(Some(StreamError::new("oops")));
        assert_eq!(b.recv().await, Some(Msg::Err(StreamError::new("oops"))));
        assert_eq!(b.recv().await, None);
    }

    #[tokio::test]
    async fn test_hup_after_both_sides() {
        let (x, y) = tokio::io::duplex(1024);
        let (mut c, hup) = Conn::open_with_hup("c", x, 4, Codec::default());
        let mut peer = Conn::open("peer", y, 4, Codec::default());

        c.close_output(None);
        peer.close_output(None);
        assert_eq!(c.recv().await, None);
        tokio::time::timeout(std::time::Duration::from_secs(2), hup)
            .await
            .expect("hup not signalled")
            .unwrap();
    }
}
