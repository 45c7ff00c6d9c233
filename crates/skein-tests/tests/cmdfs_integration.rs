//! Command tree integration tests.
//!
//! Commands driven through a client talking to a served tree:
//! - Command lifecycle from mkdir to remove
//! - Streaming reads of a slow command's output
//! - Environment variables and the /Ctl counters

use std::time::{Duration, Instant};

use skein_proto::Dir;
use skein_tests::TestServer;
use tokio::time::timeout;

/// Initialize tracing for tests.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("skein_cmdfs=debug,skein_srv=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_command_lifecycle() {
    init_tracing();
    let ts = TestServer::in_memory().unwrap();
    let client = &ts.client;

    client.mkdir("/e0", &Dir::new()).await.unwrap();
    client.mkdir("/e0/c0", &Dir::new()).await.unwrap();
    assert_eq!(client.get_all("/e0/c0/sts").await.unwrap(), b"not started\n");

    client.put_all("/e0/c0/cmd", "echo hi").await.unwrap();
    assert_eq!(client.get_all("/e0/c0/wait").await.unwrap(), b"success\n");
    assert_eq!(client.get_all("/e0/c0/out").await.unwrap(), b"hi\n");
    assert_eq!(client.get_all("/e0/c0/err").await.unwrap(), b"");
    assert_eq!(client.get_all("/e0/c0/cmd").await.unwrap(), b"echo hi");

    let cmd = ts.tree.cmd("e0", "c0").unwrap();
    client.remove("/e0/c0", false).await.unwrap();
    assert!(ts.tree.cmd("e0", "c0").is_none());
    timeout(Duration::from_secs(2), cmd.wait()).await.unwrap();
    let err = client.stat("/e0/c0").await.unwrap_err();
    assert_eq!(err.remote_message(), Some("/e0/c0: file does not exist"));
}

#[tokio::test]
async fn test_remove_stops_running_command() {
    init_tracing();
    let ts = TestServer::in_memory().unwrap();
    let path = ts.run("e0", "long", "sleep 30").await.unwrap();
    let cmd = ts.tree.cmd("e0", "long").unwrap();
    assert_eq!(ts.client.get_all(&format!("{}/sts", path)).await.unwrap(), b"running\n");

    ts.client.remove(&path, false).await.unwrap();
    timeout(Duration::from_secs(5), cmd.wait())
        .await
        .expect("removed command still running");
    assert_eq!(cmd.status(), "signal SIGKILL\n");
}

#[tokio::test]
async fn test_remove_env_stops_its_commands() {
    init_tracing();
    let ts = TestServer::in_memory().unwrap();
    ts.run("e1", "a", "sleep 30").await.unwrap();
    ts.run("e1", "b", "sleep 30").await.unwrap();
    let a = ts.tree.cmd("e1", "a").unwrap();
    let b = ts.tree.cmd("e1", "b").unwrap();

    ts.client.remove("/e1", true).await.unwrap();
    timeout(Duration::from_secs(5), async {
        a.wait().await;
        b.wait().await;
    })
    .await
    .unwrap();
    let names: Vec<_> = ts
        .client
        .getdir("/")
        .await
        .unwrap()
        .iter()
        .map(|d| d.name().to_string())
        .collect();
    assert_eq!(names, vec!["Ctl"]);
}

#[tokio::test]
async fn test_streaming_partial_read() {
    init_tracing();
    let ts = TestServer::in_memory().unwrap();
    let path = ts
        .run("e0", "c0", "for i in 1 2 3 4; do printf $i; sleep 1; done")
        .await
        .unwrap();
    let pout = format!("{}/pout", path);

    let start = Instant::now();
    let first = ts.client.get(&pout, 0, 65536).await.unwrap();
    let (chunks, err) = first.drain().await;
    assert!(err.is_none());
    let first = chunks.concat();
    assert!(!first.is_empty());
    assert!(
        start.elapsed() < Duration::from_secs(3),
        "first read took {:?}",
        start.elapsed()
    );

    let mut all = first;
    loop {
        let rx = ts.client.get(&pout, all.len() as u64, 65536).await.unwrap();
        let (chunks, err) = timeout(Duration::from_secs(5), rx.drain()).await.unwrap();
        assert!(err.is_none(), "{:?}", err);
        let data = chunks.concat();
        if data.is_empty() {
            break;
        }
        all.extend_from_slice(&data);
    }
    assert_eq!(all, b"1234");
    assert_eq!(ts.client.get_all(&format!("{}/sts", path)).await.unwrap(), b"success\n");
}

#[tokio::test]
async fn test_streaming_read_reports_failure() {
    init_tracing();
    let ts = TestServer::in_memory().unwrap();
    let path = ts.run("e0", "bad", "echo oops >&2; exit 3").await.unwrap();
    ts.client.get_all(&format!("{}/wait", path)).await.unwrap();
    let perr = ts.client.get(&format!("{}/perr", path), 0, -1).await.unwrap();
    let (chunks, err) = perr.drain().await;
    assert_eq!(chunks.concat(), b"oops\n");
    assert_eq!(err.unwrap().message(), "exit status 3");
}

#[tokio::test]
async fn test_input_and_vars_reach_command() {
    init_tracing();
    let ts = TestServer::in_memory().unwrap();
    let client = &ts.client;
    client.mkdir("/e0", &Dir::new()).await.unwrap();
    client.put_all("/e0/vars/GREETING", "hello").await.unwrap();
    std::fs::create_dir(ts.workdir().join("sub")).unwrap();
    client.put_all("/e0/vars/dot", "sub").await.unwrap();

    let path = ts.mkcmd("e0", "c0").await.unwrap();
    client.put_all(&format!("{}/in", path), "from stdin\n").await.unwrap();
    client
        .put_all(&format!("{}/cmd", path), "cat; echo $GREETING; basename $(pwd)")
        .await
        .unwrap();
    assert_eq!(client.get_all(&format!("{}/wait", path)).await.unwrap(), b"success\n");
    assert_eq!(
        client.get_all(&format!("{}/out", path)).await.unwrap(),
        b"from stdin\nhello\nsub\n"
    );

    client.remove("/e0/vars/GREETING", false).await.unwrap();
    let path = ts.run("e0", "c1", "echo \"[$GREETING]\"").await.unwrap();
    client.get_all(&format!("{}/wait", path)).await.unwrap();
    assert_eq!(client.get_all(&format!("{}/out", path)).await.unwrap(), b"[]\n");
}

#[tokio::test]
async fn test_signal_and_restart() {
    init_tracing();
    let ts = TestServer::in_memory().unwrap();
    let path = ts.run("e0", "c0", "trap '' TERM; echo ready; sleep 30").await.unwrap();
    let sig = format!("{}/sig", path);
    let ready = ts.client.get(&format!("{}/pout", path), 0, 64).await.unwrap();
    assert_eq!(ready.drain().await.0.concat(), b"ready\n");

    let err = ts.client.put_all(&sig, "hup").await.unwrap_err();
    assert_eq!(err.remote_message(), Some("/e0/c0/sig: bad signal 'hup'"));

    ts.client.put_all(&sig, "restart").await.unwrap();
    assert_eq!(
        ts.client.get_all(&format!("{}/wait", path)).await.unwrap(),
        b"signal SIGKILL\n"
    );
    let d = ts.client.stat(&path).await.unwrap();
    assert_eq!(d.get("restart"), "y");
}

#[tokio::test]
async fn test_ctl_counts_requests() {
    init_tracing();
    let ts = TestServer::in_memory().unwrap();
    let client = &ts.client;
    client.put_all("/Ctl", "clear").await.unwrap();

    client.mkdir("/e0", &Dir::new()).await.unwrap();
    client.mkdir("/e0", &Dir::new()).await.unwrap_err();
    client.stat("/e0").await.unwrap();

    let txt = String::from_utf8(client.get_all("/Ctl").await.unwrap()).unwrap();
    assert!(txt.starts_with("test:\n"), "{}", txt);
    assert!(txt.contains("mkdir: 2 calls 1 errs 0 bytes\n"), "{}", txt);
    assert!(txt.contains("stat: 1 calls 0 errs 0 bytes\n"), "{}", txt);

    let err = client.put_all("/Ctl", "reboot").await.unwrap_err();
    assert!(err.remote_message().unwrap().contains("bad ctl request"));

    let root = client.stat("/").await.unwrap();
    assert_eq!(root.get("virtual"), "y");
    assert_eq!(root.size(), 2);
}
