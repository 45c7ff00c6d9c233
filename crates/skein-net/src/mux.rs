//! Stream multiplexer.
//!
//! Many logical streams share one byte device. Each frame tag carries a
//! 28-bit stream id plus four flags:
//!
//! - `FIRST`: first frame of a stream; creates it on the receiving side
//! - `RPC`: the stream expects a reply stream with the same id
//! - `FLOW`: a flow credit for the stream; with `END` it is a pushback,
//!   telling the writer its reader went away
//! - `END`: last frame of a stream; the payload, if any, is the error
//!
//! The caller side allocates odd ids and the callee side even ids.
//!
//! Flow control: a writer holds credits, each allowing `nbuf/2` frames.
//! It starts with two. The reading side grants a credit every time its
//! user has consumed `nbuf/2` messages, so no stream has more than `nbuf`
//! frames in flight and a stalled reader never blocks other streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use skein_core::{channel, Closer, Receiver, Sender, StreamError};
use skein_proto::{Codec, CodecError, Msg};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, trace, warn};

use crate::conn::Conn;

/// First frame of a stream.
pub const FIRST: u32 = 1 << 31;
/// Stream expecting a reply.
pub const RPC: u32 = 1 << 30;
/// Flow credit.
pub const FLOW: u32 = 1 << 29;
/// Last frame of a stream.
pub const END: u32 = 1 << 28;
/// All flag bits.
pub const TAG_MASK: u32 = FIRST | RPC | FLOW | END;

/// Credits a writer starts with.
const INITIAL_CREDITS: usize = 2;

/// Multiplexer configuration.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Queue size of each stream; at least 2
    pub nbuf: usize,
    /// Number of unaccepted incoming streams buffered
    pub accept_backlog: usize,
    /// Label used in stream tags and traces
    pub label: String,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            nbuf: 1024,
            accept_backlog: 10,
            label: "mux".to_string(),
        }
    }
}

impl MuxConfig {
    /// Creates a configuration with the given label.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }
}

/// Multiplexer counters.
#[derive(Debug, Default, Clone)]
pub struct MuxStats {
    /// Frames written
    pub frames_out: u64,
    /// Frames read
    pub frames_in: u64,
    /// Frames dropped for closed streams
    pub discarded: u64,
    /// Flow credits granted to the peer
    pub credits_granted: u64,
    /// Live streams
    pub streams: usize,
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// One live stream as seen by the mux.
struct Stream {
    /// Demuxed input, fed to the flow pump
    input: Option<Sender<Msg>>,
    /// Close handle of the user's output queue
    output: Option<Closer>,
    credits: Arc<Semaphore>,
    in_open: bool,
    out_open: bool,
}

impl Stream {
    fn close(mut self, err: &StreamError) {
        if let Some(tx) = self.input.take() {
            tx.close_with(Some(err.clone()));
        }
        if let Some(out) = self.output.take() {
            out.close_with(Some(err.clone()));
        }
        self.credits.close();
    }
}

#[derive(Default)]
struct State {
    tag: u32,
    tags: HashMap<u32, Stream>,
    err: Option<StreamError>,
    closed: bool,
    accept: Option<Sender<Conn>>,
}

impl State {
    fn next_id(&mut self) -> u32 {
        loop {
            if (self.tag + 2) & TAG_MASK != 0 {
                self.tag &= 1;
            }
            self.tag += 2;
            if !self.tags.contains_key(&self.tag) {
                return self.tag;
            }
        }
    }

    fn remove_if_done(&mut self, id: u32) {
        if let Some(s) = self.tags.get(&id) {
            if !s.in_open && !s.out_open {
                self.tags.remove(&id);
                trace!(id = format_args!("{:x}", id), "stream released");
            }
        }
    }
}

struct Inner {
    label: String,
    /// Low bit of the ids we allocate
    parity: u32,
    nbuf: usize,
    codec: Codec,
    writer: tokio::sync::Mutex<Option<Writer>>,
    state: Mutex<State>,
    hup: watch::Sender<bool>,
    frames_out: AtomicU64,
    frames_in: AtomicU64,
    discarded: AtomicU64,
    credits_granted: AtomicU64,
}

impl Inner {
    fn stream_tag(&self, id: u32) -> String {
        format!("{}!{:x}", self.label, id)
    }

    fn half(&self) -> usize {
        self.nbuf / 2
    }

    /// Writes one frame; header and payload go out under the write lock.
    async fn write_frame(&self, tag: u32, msg: &Msg) -> Result<usize, CodecError> {
        let mut guard = self.writer.lock().await;
        let w = match guard.as_mut() {
            Some(w) => w,
            None => return Err(CodecError::Stream(self.error_or_closed())),
        };
        let n = self.codec.write_msg(w, tag, msg).await?;
        w.flush().await?;
        self.frames_out.fetch_add(1, Ordering::Relaxed);
        trace!(mux = %self.label, tag = format_args!("{:x}", tag), "-> frame");
        Ok(n)
    }

    fn error_or_closed(&self) -> StreamError {
        self.state
            .lock()
            .err
            .clone()
            .unwrap_or_else(|| StreamError::new("mux closed"))
    }

    fn latch(&self, err: StreamError) {
        let mut st = self.state.lock();
        if st.err.is_none() {
            st.err = Some(err);
        }
    }

    /// Registers a new stream with the given queues.
    fn add_stream(&self, st: &mut State, id: u32, input: Option<Sender<Msg>>, output: Option<Closer>) -> Arc<Semaphore> {
        let credits = Arc::new(Semaphore::new(INITIAL_CREDITS));
        st.tags.insert(
            id,
            Stream {
                in_open: input.is_some(),
                out_open: output.is_some(),
                input,
                output,
                credits: credits.clone(),
            },
        );
        debug!(mux = %self.label, id = format_args!("{:x}", id), "new stream");
        credits
    }

    /// The writer for `id` finished.
    fn out_done(&self, id: u32, err: Option<StreamError>) {
        let mut st = self.state.lock();
        if let Some(err) = err {
            if let Some(s) = st.tags.remove(&id) {
                s.close(&err);
            }
            return;
        }
        if let Some(s) = st.tags.get_mut(&id) {
            s.out_open = false;
            s.output = None;
        }
        st.remove_if_done(id);
    }

    /// The peer ended its output on `id`.
    fn peer_end(&self, id: u32, err: Option<StreamError>) {
        let mut st = self.state.lock();
        if let Some(s) = st.tags.get_mut(&id) {
            if let Some(tx) = s.input.take() {
                tx.close_with(err);
            }
            s.in_open = false;
        }
        st.remove_if_done(id);
    }

    /// The peer abandoned its input on `id`; stop our writer.
    fn peer_abandon(&self, id: u32, err: StreamError) {
        let mut st = self.state.lock();
        if let Some(s) = st.tags.get_mut(&id) {
            if let Some(out) = &s.output {
                out.close_with(Some(err));
            }
            s.credits.close();
        }
    }

    /// Our user abandoned its input on `id`; push back to the peer.
    async fn abandon(&self, id: u32, err: StreamError) {
        let notify = {
            let mut st = self.state.lock();
            let mut notify = false;
            if let Some(s) = st.tags.get_mut(&id) {
                notify = s.in_open;
                s.in_open = false;
                s.input = None;
            }
            st.remove_if_done(id);
            notify
        };
        if notify {
            debug!(mux = %self.label, id = format_args!("{:x}", id), %err, "pushback");
            let _ = self.write_frame(id | FLOW | END, &Msg::Err(err)).await;
        }
    }

    fn grant(&self, id: u32) {
        let st = self.state.lock();
        if let Some(s) = st.tags.get(&id) {
            s.credits.add_permits(1);
        }
    }

    fn input_of(&self, id: u32) -> Option<Sender<Msg>> {
        self.state.lock().tags.get(&id).and_then(|s| s.input.clone())
    }

    fn shutdown(self: &Arc<Self>) {
        let mut st = self.state.lock();
        if st.closed {
            return;
        }
        st.closed = true;
        let err = st
            .err
            .get_or_insert_with(|| StreamError::new("mux closed by user"))
            .clone();
        debug!(mux = %self.label, %err, "closed");
        if let Some(accept) = st.accept.take() {
            accept.close_with(Some(err.clone()));
        }
        for (_, s) in st.tags.drain() {
            s.close(&err);
        }
        drop(st);

        match self.writer.try_lock() {
            Ok(mut w) => {
                w.take();
            }
            Err(_) => {
                if let Ok(rt) = tokio::runtime::Handle::try_current() {
                    let inner = self.clone();
                    rt.spawn(async move {
                        inner.writer.lock().await.take();
                    });
                }
            }
        }
        self.hup.send_replace(true);
    }
}

/// A multiplexed set of streams on one duplex device.
///
/// Cloning yields another handle to the same mux.
#[derive(Clone)]
pub struct Mux {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Mux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mux")
            .field("label", &self.inner.label)
            .field("nbuf", &self.inner.nbuf)
            .finish()
    }
}

impl Mux {
    /// Starts a mux on `device`.
    ///
    /// Returns the mux and the queue of streams opened by the peer. One end
    /// of the device must be the caller and the other the callee. The device
    /// is released when I/O fails or the mux is closed.
    pub fn new<D>(device: D, is_caller: bool, config: MuxConfig, codec: Codec) -> (Self, Receiver<Conn>)
    where
        D: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (rd, wr) = tokio::io::split(device);
        let (accept_tx, accept_rx) = channel(config.accept_backlog);
        let (hup, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            label: config.label,
            parity: u32::from(is_caller),
            nbuf: config.nbuf.max(2),
            codec,
            writer: tokio::sync::Mutex::new(Some(Box::new(wr))),
            state: Mutex::new(State {
                tag: if is_caller { 1 } else { 0 },
                accept: Some(accept_tx.clone()),
                ..Default::default()
            }),
            hup,
            frames_out: AtomicU64::new(0),
            frames_in: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            credits_granted: AtomicU64::new(0),
        });
        tokio::spawn(demux(inner.clone(), rd, accept_tx));
        (Self { inner }, accept_rx)
    }

    /// Returns two muxes wired to each other in memory: (callee, caller).
    pub fn pair(config: MuxConfig, codec: Codec) -> ((Mux, Receiver<Conn>), (Mux, Receiver<Conn>)) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let callee = Mux::new(
            a,
            false,
            MuxConfig {
                label: format!("{}1", config.label),
                ..config.clone()
            },
            codec.clone(),
        );
        let caller = Mux::new(
            b,
            true,
            MuxConfig {
                label: format!("{}2", config.label),
                ..config
            },
            codec,
        );
        (callee, caller)
    }

    /// Opens an output-only stream to the peer.
    pub fn out(&self) -> Conn {
        self.open(false)
    }

    /// Opens a stream whose peer may reply on the same id.
    pub fn rpc(&self) -> Conn {
        self.open(true)
    }

    fn open(&self, rpc: bool) -> Conn {
        let inner = &self.inner;
        let (out_tx, out_rx) = channel::<Msg>(inner.nbuf);
        let mut st = inner.state.lock();
        let id = st.next_id();
        let tag = inner.stream_tag(id);
        if st.closed {
            let err = st.err.clone().unwrap_or_else(|| StreamError::new("mux closed"));
            out_tx.close_with(Some(err));
            return Conn::new(tag, None, Some(out_tx));
        }
        let mut input = None;
        let mut demuxed = None;
        if rpc {
            let (min_tx, min_rx) = channel::<Msg>(inner.nbuf);
            let (uin_tx, uin_rx) = channel::<Msg>(1);
            tokio::spawn(flow_pump(inner.clone(), id, min_rx, uin_tx));
            demuxed = Some(min_tx);
            input = Some(uin_rx);
        }
        let credits = inner.add_stream(&mut st, id, demuxed, Some(out_tx.closer()));
        drop(st);
        tokio::spawn(writer(inner.clone(), id, rpc, out_rx, credits));
        Conn::new(tag, input, Some(out_tx))
    }

    /// Closes the mux and every live stream. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    /// Returns true once the mux is torn down.
    pub fn is_closed(&self) -> bool {
        *self.inner.hup.borrow()
    }

    /// Waits until the mux is torn down.
    pub async fn hup(&self) {
        wait_hup(&mut self.inner.hup.subscribe()).await;
    }

    /// Returns the latched error, if any.
    pub fn error(&self) -> Option<StreamError> {
        self.inner.state.lock().err.clone()
    }

    /// Returns the mux label.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Returns the current counters.
    pub fn stats(&self) -> MuxStats {
        MuxStats {
            frames_out: self.inner.frames_out.load(Ordering::Relaxed),
            frames_in: self.inner.frames_in.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
            credits_granted: self.inner.credits_granted.load(Ordering::Relaxed),
            streams: self.inner.state.lock().tags.len(),
        }
    }
}

async fn wait_hup(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

/// Takes one credit, good for `nbuf/2` frames.
async fn take_credit(credits: &Semaphore) -> bool {
    match credits.acquire().await {
        Ok(permit) => {
            permit.forget();
            true
        }
        Err(_) => false,
    }
}

/// Sends the user's output queue for stream `id` to the peer.
async fn writer(inner: Arc<Inner>, id: u32, rpc: bool, mut rx: Receiver<Msg>, credits: Arc<Semaphore>) {
    let mut tag = id | FIRST;
    if rpc {
        tag |= RPC;
    }
    let mut left = if take_credit(&credits).await { inner.half() } else { 0 };
    let mut failed = None;
    while let Some(msg) = rx.recv().await {
        if left == 0 {
            trace!(mux = %inner.label, tag = format_args!("{:x}", tag), "stop flow");
            if !take_credit(&credits).await {
                break;
            }
            trace!(mux = %inner.label, tag = format_args!("{:x}", tag), "cont flow");
            left += inner.half();
        }
        match inner.write_frame(tag, &msg).await {
            Ok(_) => {
                left -= 1;
                tag &= !FIRST;
            }
            Err(CodecError::Discarded) => {
                left -= 1;
            }
            Err(e) => {
                let err = StreamError::from(e);
                warn!(mux = %inner.label, tag = format_args!("{:x}", tag), %err, "write failed");
                rx.close_with(Some(err.clone()));
                inner.latch(err.clone());
                failed = Some(err);
                break;
            }
        }
    }
    let err = failed.clone().or_else(|| rx.error());
    if failed.is_none() {
        let end = match &err {
            Some(e) => Msg::Err(e.clone()),
            None => Msg::Bytes(Bytes::new()),
        };
        let _ = inner.write_frame(tag | END, &end).await;
    }
    trace!(mux = %inner.label, tag = format_args!("{:x}", tag), ?err, "writer done");
    inner.out_done(id, failed);
}

/// Moves demuxed messages to the user and grants credits as they are taken.
async fn flow_pump(inner: Arc<Inner>, id: u32, mut min: Receiver<Msg>, uin: Sender<Msg>) {
    let mut posts = 0;
    loop {
        let msg = tokio::select! {
            m = min.recv() => m,
            _ = uin.closed() => {
                let err = uin.error().unwrap_or_else(StreamError::closed);
                min.close_with(Some(err.clone()));
                inner.abandon(id, err).await;
                return;
            }
        };
        let Some(msg) = msg else {
            uin.close_with(min.error());
            return;
        };
        if let Err(err) = uin.send(msg).await {
            min.close_with(Some(err.clone()));
            inner.abandon(id, err).await;
            return;
        }
        posts += 1;
        if posts == inner.half() {
            trace!(mux = %inner.label, id = format_args!("{:x}", id), "+flow");
            if inner.write_frame(id | FLOW, &Msg::Bytes(Bytes::new())).await.is_ok() {
                inner.credits_granted.fetch_add(1, Ordering::Relaxed);
            }
            posts = 0;
        }
    }
}

/// Reads frames and routes them to their streams.
async fn demux<R>(inner: Arc<Inner>, mut rd: ReadHalf<R>, accept: Sender<Conn>)
where
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut hup = inner.hup.subscribe();
    loop {
        let res = tokio::select! {
            r = inner.codec.read_msg(&mut rd) => r,
            _ = wait_hup(&mut hup) => break,
        };
        let frame = match res {
            Ok(Some(f)) => f,
            Ok(None) => {
                debug!(mux = %inner.label, "hangup");
                break;
            }
            Err(e) => {
                warn!(mux = %inner.label, error = %e, "read failed");
                inner.latch(StreamError::from(e));
                break;
            }
        };
        inner.frames_in.fetch_add(1, Ordering::Relaxed);
        let tag = frame.tag;
        let id = tag & !TAG_MASK;
        trace!(mux = %inner.label, tag = format_args!("{:x}", tag), "<- frame");

        if tag & FLOW != 0 {
            if tag & END != 0 {
                let err = match frame.msg {
                    Msg::Err(e) => e,
                    _ => StreamError::closed(),
                };
                inner.peer_abandon(id, err);
            } else {
                inner.grant(id);
            }
            continue;
        }

        let known = inner.state.lock().tags.contains_key(&id);
        if !known {
            // Late frames of closed streams, or replies to streams we dropped.
            if tag & FIRST == 0 || id & 1 == inner.parity {
                trace!(mux = %inner.label, tag = format_args!("{:x}", tag), "discard");
                inner.discarded.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if let Err(err) = accept_stream(&inner, id, tag & RPC != 0, &accept).await {
                inner.latch(err);
                break;
            }
        }

        if tag & END != 0 {
            let err = match frame.msg {
                Msg::Err(e) => Some(e),
                _ => None,
            };
            inner.peer_end(id, err);
            continue;
        }
        if let Some(tx) = inner.input_of(id) {
            // Errors mean the flow pump already pushed back.
            let _ = tx.send(frame.msg).await;
        } else {
            inner.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
    drop(rd);
    inner.shutdown();
}

/// Creates the local side of a stream opened by the peer.
async fn accept_stream(inner: &Arc<Inner>, id: u32, rpc: bool, accept: &Sender<Conn>) -> Result<(), StreamError> {
    let (min_tx, min_rx) = channel::<Msg>(inner.nbuf);
    let (uin_tx, uin_rx) = channel::<Msg>(1);
    let mut reply = None;
    let credits = {
        let mut st = inner.state.lock();
        let closer = if rpc {
            let (out_tx, out_rx) = channel::<Msg>(inner.nbuf);
            let closer = out_tx.closer();
            reply = Some((out_tx, out_rx));
            Some(closer)
        } else {
            None
        };
        inner.add_stream(&mut st, id, Some(min_tx), closer)
    };
    tokio::spawn(flow_pump(inner.clone(), id, min_rx, uin_tx));

    let (output, out_rx) = match reply {
        Some((tx, rx)) => (Some(tx), Some(rx)),
        None => (None, None),
    };
    let conn = Conn::new(inner.stream_tag(id), Some(uin_rx), output);
    if let Err(e) = accept.send(conn).await {
        let err = if e == StreamError::closed() {
            StreamError::new("mux incoming queue is closed")
        } else {
            e
        };
        if let Some(s) = inner.state.lock().tags.remove(&id) {
            s.close(&err);
        }
        return Err(err);
    }
    if let Some(rx) = out_rx {
        tokio::spawn(writer(inner.clone(), id, true, rx, credits));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pair(nbuf: usize) -> ((Mux, Receiver<Conn>), (Mux, Receiver<Conn>)) {
        let config = MuxConfig {
            nbuf,
            ..MuxConfig::new("test")
        };
        Mux::pair(config, Codec::default())
    }

    #[test]
    fn test_tag_generation_parity() {
        let mut caller = State {
            tag: 1,
            ..Default::default()
        };
        let mut callee = State::default();
        for _ in 0..100 {
            assert_eq!(caller.next_id() & 1, 1);
            assert_eq!(callee.next_id() & 1, 0);
        }
    }

    #[test]
    fn test_tag_wrap_keeps_parity() {
        let mut caller = State {
            tag: !TAG_MASK,
            ..Default::default()
        };
        assert_eq!(caller.next_id(), 3);
        let mut callee = State {
            tag: !TAG_MASK - 1,
            ..Default::default()
        };
        assert_eq!(callee.next_id(), 2);
    }

    #[tokio::test]
    async fn test_out_stream() {
        let ((_callee, mut incoming), (caller, _)) = pair(16);
        let mut c = caller.out();
        assert!(c.input.is_none());
        c.send("one").await.unwrap();
        c.send("two").await.unwrap();
        c.close_output(None);

        let mut s = incoming.recv().await.unwrap();
        assert!(s.output.is_none());
        assert_eq!(s.recv().await, Some(Msg::from("one")));
        assert_eq!(s.recv().await, Some(Msg::from("two")));
        assert_eq!(s.recv().await, None);
        assert!(s.input.as_ref().unwrap().error().is_none());
    }

    #[tokio::test]
    async fn test_rpc_reply() {
        let ((_callee, mut incoming), (caller, _)) = pair(16);
        let mut c = caller.rpc();
        c.send("hi").await.unwrap();
        c.close_output(None);

        let mut s = incoming.recv().await.unwrap();
        while let Some(m) = s.recv().await {
            let txt = format!("{}.repl", m.as_str().unwrap());
            s.send(txt).await.unwrap();
        }
        s.close_output(None);

        assert_eq!(c.recv().await, Some(Msg::from("hi.repl")));
        assert_eq!(c.recv().await, None);
        assert!(c.input.as_ref().unwrap().error().is_none());
    }

    #[tokio::test]
    async fn test_error_close_propagates() {
        let ((_callee, mut incoming), (caller, _)) = pair(16);
        let mut c = caller.out();
        c.send(&b"x"[..]).await.unwrap();
        c.close_output(Some(StreamError::new("broken")));

        let mut s = incoming.recv().await.unwrap();
        assert_eq!(s.recv().await, Some(Msg::from(&b"x"[..])));
        assert_eq!(s.recv().await, None);
        assert_eq!(s.input.as_ref().unwrap().error().unwrap().message(), "broken");
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let ((_callee, mut incoming), (caller, _)) = pair(16);
        let mut c = caller.out();
        c.close_output(None);
        let mut s = incoming.recv().await.unwrap();
        assert_eq!(s.recv().await, None);
    }

    #[tokio::test]
    async fn test_streams_released() {
        let ((callee, mut incoming), (caller, _)) = pair(16);
        let mut c = caller.rpc();
        c.send("q").await.unwrap();
        c.close_output(None);
        let mut s = incoming.recv().await.unwrap();
        s.recv().await.unwrap();
        assert_eq!(s.recv().await, None);
        s.send("a").await.unwrap();
        s.close_output(None);
        assert_eq!(c.recv().await, Some(Msg::from("a")));
        assert_eq!(c.recv().await, None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(caller.stats().streams, 0);
        assert_eq!(callee.stats().streams, 0);
    }

    #[tokio::test]
    async fn test_close_fails_streams() {
        let ((callee, mut incoming), (caller, _)) = pair(16);
        let c = caller.rpc();
        c.send("x").await.unwrap();
        let _s = incoming.recv().await.unwrap();

        caller.close();
        caller.close();
        tokio::time::timeout(Duration::from_secs(2), caller.hup()).await.unwrap();
        assert_eq!(caller.error().unwrap().message(), "mux closed by user");
        assert!(c.send("y").await.is_err());

        tokio::time::timeout(Duration::from_secs(2), callee.hup()).await.unwrap();
        assert!(callee.is_closed());
        assert_eq!(incoming.recv().await.map(|c| c.tag), None);
    }

    #[tokio::test]
    async fn test_dropped_reader_pushes_back() {
        let ((_callee, mut incoming), (caller, _)) = pair(4);
        let c = caller.out();
        c.send("first").await.unwrap();
        let s = incoming.recv().await.unwrap();
        drop(s);

        let res = tokio::time::timeout(Duration::from_secs(2), async {
            for i in 0..100 {
                if c.send(format!("m{}", i)).await.is_err() {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(res, "writer never saw the pushback");
    }
}
