//! Codec integration tests.
//!
//! Frames written to a byte stream and read back, through the codec
//! directly and through a pair of connections.

use bytes::Bytes;
use skein_core::StreamError;
use skein_net::Conn;
use skein_proto::{kind, Addr, Codec, CodecConfig, CodecError, Dir, Msg};

/// Initialize tracing for tests.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("skein_proto=debug,skein_net=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_encode_round_trip() {
    init_tracing();
    let codec = Codec::default();
    let sent = vec![
        Msg::Bytes(Bytes::from_static(b"a byte array")),
        Msg::Ign {
            typ: 666,
            data: Bytes::from_static(b"another byte array"),
        },
        Msg::from("a string"),
        Msg::from("another string"),
        Msg::Err(StreamError::new("oops")),
    ];

    let mut wire = Vec::new();
    for m in &sent {
        codec.write_msg(&mut wire, 1, m).await.unwrap();
    }

    let mut r = &wire[..];
    let mut got = Vec::new();
    while let Some(frame) = codec.read_msg(&mut r).await.unwrap() {
        assert_eq!(frame.tag, 1);
        got.push(frame.msg);
    }

    let kinds: Vec<u16> = got.iter().map(Msg::kind).collect();
    assert_eq!(kinds, vec![kind::BYTES, 666, kind::STR, kind::STR, kind::ERR]);
    assert_eq!(got, sent);
    assert_eq!(got[4].as_err().unwrap().message(), "oops");
}

#[tokio::test]
async fn test_frame_header_on_the_wire() {
    let codec = Codec::default();
    let mut wire = Vec::new();
    let n = codec.write_msg(&mut wire, 0x8000_0003, &Msg::from("abc")).await.unwrap();
    assert_eq!(n, 13);
    assert_eq!(&wire[0..4], &3u32.to_le_bytes());
    assert_eq!(&wire[4..8], &0x8000_0003u32.to_le_bytes());
    assert_eq!(&wire[8..10], &kind::STR.to_le_bytes());
    assert_eq!(&wire[10..], b"abc");
}

#[tokio::test]
async fn test_large_frames_rejected_both_ways() {
    let small = Codec::new(CodecConfig { max_msg_size: 8 });
    let mut wire = Vec::new();
    let err = small
        .write_msg(&mut wire, 1, &Msg::from("ten bytes."))
        .await
        .unwrap_err();
    assert!(matches!(err, CodecError::TooLarge(10)));
    assert!(wire.is_empty());

    let big = Codec::default();
    big.write_msg(&mut wire, 1, &Msg::from("ten bytes.")).await.unwrap();
    let mut r = &wire[..];
    assert!(matches!(small.read_msg(&mut r).await, Err(CodecError::TooLarge(10))));
}

#[tokio::test]
async fn test_conn_pipe_pair() {
    init_tracing();
    let (mut a, mut b) = Conn::pipe_pair(16, Codec::default());

    let dir = Dir::new().with("name", "c0").with("type", "d").with("mode", "0755");
    let addr = Addr::parse("/e0/c0/out:3,5:#1,#9");
    a.send("hello").await.unwrap();
    a.send(dir.clone()).await.unwrap();
    a.send(addr.clone()).await.unwrap();
    a.send(Bytes::from_static(b"\x00\x01\x02")).await.unwrap();
    a.close_output(None);

    assert_eq!(b.recv().await, Some(Msg::from("hello")));
    assert_eq!(b.recv().await, Some(Msg::Dir(dir)));
    assert_eq!(b.recv().await, Some(Msg::Addr(addr)));
    assert_eq!(b.recv().await, Some(Msg::from(Bytes::from_static(b"\x00\x01\x02"))));
    assert_eq!(b.recv().await, None);

    b.send("back").await.unwrap();
    b.close_output(None);
    assert_eq!(a.recv().await, Some(Msg::from("back")));
    assert_eq!(a.recv().await, None);
}
