//! Bridges between byte streams and message queues.
//!
//! None of these close the queue they are given; callers close it with
//! the returned error once the bridge is done.

use bytes::Bytes;
use skein_core::{channel, Receiver, Sender, StreamError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::codec::{Codec, CodecError, MSG_SIZE};
use crate::msg::Msg;

/// Transfer counters of a bridge.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Bytes moved
    pub bytes: u64,
    /// Messages moved
    pub msgs: u64,
}

impl Stats {
    fn record(&mut self, n: usize) {
        self.bytes += n as u64;
        self.msgs += 1;
    }
}

/// Reads frames from `r` and sends their messages to `tx` until end of file.
///
/// `Err` messages are forwarded as data.
pub async fn read_msgs<R>(codec: &Codec, r: &mut R, tx: &Sender<Msg>) -> Result<Stats, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut stats = Stats::default();
    while let Some(frame) = codec.read_msg(r).await? {
        stats.record(frame.size);
        tx.send(frame.msg).await?;
    }
    Ok(stats)
}

/// Writes messages from `rx` to `w` with the given tag.
///
/// Messages the codec discards are skipped. When the queue was closed with
/// an error, that error is written as a final `Err` message and returned.
pub async fn write_msgs<W>(
    codec: &Codec,
    w: &mut W,
    tag: u32,
    rx: &mut Receiver<Msg>,
) -> Result<Stats, CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut stats = Stats::default();
    while let Some(msg) = rx.recv().await {
        match codec.write_msg(w, tag, &msg).await {
            Ok(n) => stats.record(n),
            Err(CodecError::Discarded) => {
                debug!(tag = tag, kind = msg.kind(), "discarded msg");
                continue;
            }
            Err(e) => return Err(e),
        }
        w.flush().await?;
    }
    if let Some(err) = rx.error() {
        let n = codec.write_msg(w, tag, &Msg::Err(err.clone())).await?;
        stats.record(n);
        w.flush().await?;
        return Err(CodecError::Stream(err));
    }
    Ok(stats)
}

/// Reads raw bytes from `r` and sends them in chunks of at most
/// [`MSG_SIZE`] bytes.
pub async fn read_bytes<R, T>(r: &mut R, tx: &Sender<T>) -> Result<Stats, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: From<Bytes>,
{
    let mut stats = Stats::default();
    let mut buf = vec![0u8; MSG_SIZE];
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            return Ok(stats);
        }
        stats.record(n);
        tx.send(T::from(Bytes::copy_from_slice(&buf[..n]))).await?;
    }
}

/// Writes the data bytes received from `rx` to `w`, ignoring other messages.
///
/// The first `Err` message, or else the queue's close error, is returned as
/// the final status after the queue is drained.
pub async fn write_bytes<W, T>(w: &mut W, rx: &mut Receiver<T>) -> Result<Stats, CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Into<Msg>,
{
    let mut stats = Stats::default();
    let mut status: Option<StreamError> = None;
    while let Some(m) = rx.recv().await {
        match m.into() {
            Msg::Bytes(b) => {
                w.write_all(&b).await?;
                stats.record(b.len());
            }
            Msg::Err(e) => {
                status.get_or_insert(e);
            }
            _ => {}
        }
    }
    w.flush().await?;
    match status.or_else(|| rx.error()) {
        Some(e) => Err(CodecError::Stream(e)),
        None => Ok(stats),
    }
}

/// Merges several queues into one.
///
/// The output closes once every input is done, with the first input error
/// seen. If the output consumer goes away, inputs are closed with its error.
pub fn merge<T>(inputs: Vec<Receiver<T>>, nbuf: usize) -> Receiver<T>
where
    T: Send + 'static,
{
    let (tx, rx) = channel(nbuf);
    let mut tasks = Vec::with_capacity(inputs.len());
    for mut input in inputs {
        let tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(m) = input.recv().await {
                if let Err(e) = tx.send(m).await {
                    input.close_with(Some(e));
                    break;
                }
            }
            input.error()
        }));
    }
    tokio::spawn(async move {
        let mut first = None;
        for t in tasks {
            if let Ok(Some(e)) = t.await {
                first.get_or_insert(e);
            }
        }
        tx.close_with(first);
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::preloaded;

    #[tokio::test]
    async fn test_msgs_through_bytes() {
        let codec = Codec::default();
        let (tx, mut rx) = channel(8);
        tx.send(Msg::from("one")).await.unwrap();
        tx.send(Msg::from(&b"two"[..])).await.unwrap();
        tx.close_with(Some(StreamError::new("bad end")));

        let mut wire = Vec::new();
        let err = write_msgs(&codec, &mut wire, 7, &mut rx).await.unwrap_err();
        assert_eq!(err.to_string(), "bad end");

        let (tx, rx) = channel(8);
        let stats = read_msgs(&codec, &mut &wire[..], &tx).await.unwrap();
        assert_eq!(stats.msgs, 3);
        assert_eq!(stats.bytes, wire.len() as u64);
        drop(tx);
        let (msgs, err) = rx.drain().await;
        assert!(err.is_none());
        assert_eq!(
            msgs,
            vec![
                Msg::from("one"),
                Msg::from(&b"two"[..]),
                Msg::Err(StreamError::new("bad end"))
            ]
        );
    }

    #[tokio::test]
    async fn test_read_bytes_chunks() {
        let data = vec![7u8; MSG_SIZE + 10];
        let (tx, rx) = channel::<Bytes>(4);
        let reader = tokio::spawn(async move {
            let stats = read_bytes(&mut &data[..], &tx).await.unwrap();
            assert_eq!(stats.bytes, (MSG_SIZE + 10) as u64);
        });
        let (chunks, _) = rx.drain().await;
        reader.await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), MSG_SIZE);
        assert_eq!(chunks[1].len(), 10);
    }

    #[tokio::test]
    async fn test_write_bytes_status() {
        let mut rx = preloaded(vec![
            Msg::from(&b"ab"[..]),
            Msg::from("ignored"),
            Msg::Err(StreamError::new("first")),
            Msg::from(&b"cd"[..]),
            Msg::Err(StreamError::new("second")),
        ]);
        let mut out = Vec::new();
        let err = write_bytes(&mut out, &mut rx).await.unwrap_err();
        assert_eq!(out, b"abcd");
        assert_eq!(err.to_string(), "first");

        let mut rx = preloaded(vec![Bytes::from_static(b"xyz")]);
        let mut out = Vec::new();
        let stats = write_bytes(&mut out, &mut rx).await.unwrap();
        assert_eq!(stats.bytes, 3);
    }

    #[tokio::test]
    async fn test_merge() {
        let (tx1, rx1) = channel(4);
        let (tx2, rx2) = channel(4);
        tx1.send(1).await.unwrap();
        tx2.send(2).await.unwrap();
        tx1.close();
        tx2.close_with(Some(StreamError::new("two failed")));

        let (mut got, err) = merge(vec![rx1, rx2], 4).drain().await;
        got.sort();
        assert_eq!(got, vec![1, 2]);
        assert_eq!(err.unwrap().message(), "two failed");
    }
}
