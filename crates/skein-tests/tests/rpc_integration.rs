//! File tree RPC over TCP.
//!
//! A served tree on a loopback port, used by one or more clients.

use std::time::Duration;

use bytes::Bytes;
use skein_core::channel;
use skein_net::MuxConfig;
use skein_proto::{Codec, Dir};
use skein_srv::Client;
use skein_tests::TestServer;
use tokio::time::timeout;

/// Initialize tracing for tests.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("skein_srv=debug,skein_net=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_tree_over_tcp() {
    init_tracing();
    let ts = TestServer::over_tcp().await.unwrap();
    let client = &ts.client;

    let root = client.stat("/").await.unwrap();
    assert!(root.is_dir());
    assert_eq!(root.path(), "/");

    let path = ts.run("e0", "c0", "echo over tcp; echo to stderr >&2").await.unwrap();
    assert_eq!(client.get_all(&format!("{}/wait", path)).await.unwrap(), b"success\n");
    assert_eq!(client.get_all(&format!("{}/out", path)).await.unwrap(), b"over tcp\n");
    assert_eq!(client.get_all(&format!("{}/err", path)).await.unwrap(), b"to stderr\n");

    let files: Vec<_> = client
        .getdir(&path)
        .await
        .unwrap()
        .iter()
        .map(|d| (d.name().to_string(), d.mode()))
        .collect();
    assert_eq!(files.len(), 9);
    assert_eq!(files[0], ("cmd".to_string(), 0o644));
    assert_eq!(files[8], ("sig".to_string(), 0o220));
}

#[tokio::test]
async fn test_streamed_put() {
    init_tracing();
    let ts = TestServer::over_tcp().await.unwrap();
    let path = ts.mkcmd("e0", "wc").await.unwrap();

    let (tx, rx) = channel(4);
    let feeder = tokio::spawn(async move {
        for i in 0..100 {
            tx.send(Bytes::from(format!("line {}\n", i))).await.unwrap();
        }
        tx.close();
    });
    ts.client
        .put(&format!("{}/in", path), &Dir::new(), 0, rx)
        .await
        .unwrap();
    feeder.await.unwrap();
    assert_eq!(ts.client.stat(&format!("{}/in", path)).await.unwrap().size(), 790);

    ts.client.put_all(&format!("{}/cmd", path), "wc -l").await.unwrap();
    ts.client.get_all(&format!("{}/wait", path)).await.unwrap();
    let out = ts.client.get_all(&format!("{}/out", path)).await.unwrap();
    assert_eq!(String::from_utf8(out).unwrap().trim(), "100");
}

#[tokio::test]
async fn test_failed_put_keeps_connection_usable() {
    init_tracing();
    let ts = TestServer::over_tcp().await.unwrap();
    let err = ts.client.put_all("/nope/vars/X", "1").await.unwrap_err();
    assert_eq!(err.remote_message(), Some("/nope: file does not exist"));
    let err = ts.client.put_all("/Ctl/x", "1").await.unwrap_err();
    assert!(err.remote_message().is_some());
    let err = ts.client.mv("/Ctl", "/Ctl2").await.unwrap_err();
    assert!(err.remote_message().is_some());

    ts.client.mkdir("/e0", &Dir::new()).await.unwrap();
    assert!(ts.client.stat("/e0").await.unwrap().is_dir());
}

#[tokio::test]
async fn test_two_clients_share_the_tree() {
    init_tracing();
    let ts = TestServer::over_tcp().await.unwrap();
    let path = ts.mkcmd("shared", "c0").await.unwrap();

    // A second connection to the same server sees the same tree.
    let other = second_client(&ts).await;
    other
        .put_all(&format!("{}/cmd", path), "echo from the other side")
        .await
        .unwrap();
    let out = timeout(Duration::from_secs(5), async {
        ts.client.get_all(&format!("{}/wait", path)).await.unwrap();
        ts.client.get_all(&format!("{}/out", path)).await.unwrap()
    })
    .await
    .unwrap();
    assert_eq!(out, b"from the other side\n");
    other.close();
    assert!(ts.client.stat("/shared").await.is_ok());
}

async fn second_client(ts: &TestServer) -> Client {
    let addr = ts.local_addr().expect("served over tcp");
    Client::dial(&addr, MuxConfig::new("cli2"), Codec::default())
        .await
        .unwrap()
}
