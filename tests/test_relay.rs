use std::{io::Write, net::SocketAddr, path::Path, time::Duration};

use file_relay::{
    client::FileRelayClient,
    common::{ServerOptions, TimeoutOptions},
    server::FileRelayServer,
    transfer::StatsSnapshot,
};
use tempfile::NamedTempFile;
use tokio::{io::AsyncReadExt, net::TcpStream, time};

fn init_tracing() {
    // Set the tracing log level to debug
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

fn fixture(content: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content).unwrap();
    file.flush().unwrap();
    file
}

async fn start_server(options: ServerOptions) -> (FileRelayServer, String) {
    let mut server = FileRelayServer::new(options).unwrap();
    let addr: SocketAddr = server.listen().await.unwrap();
    (server, addr.to_string())
}

fn local_options(file_path: &Path) -> ServerOptions {
    ServerOptions::new("127.0.0.1", 0, file_path)
}

/// Poll the server counters until `done` holds or five seconds pass.
async fn wait_for_stats(
    server: &FileRelayServer,
    done: impl Fn(&StatsSnapshot) -> bool,
) -> StatsSnapshot {
    let deadline = time::Instant::now() + Duration::from_secs(5);
    loop {
        let stats = server.stats();
        if done(&stats) || time::Instant::now() >= deadline {
            return stats;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_streams_whole_file() {
    init_tracing();
    let content = pattern(2500);
    let file = fixture(&content);
    let mut options = local_options(file.path());
    options.buffer_size = 1024;
    let (mut server, addr) = start_server(options).await;

    let data = FileRelayClient::default().fetch(&addr).await.unwrap();
    assert_eq!(data.len(), 2500);
    assert_eq!(&data[..], &content[..]);

    let stats = wait_for_stats(&server, |s| s.completed == 1).await;
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.bytes_sent, 2500);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_sequential_clients_get_identical_bytes() {
    init_tracing();
    let content = pattern(10_000);
    let file = fixture(&content);
    let (mut server, addr) = start_server(local_options(file.path())).await;

    let client = FileRelayClient::default();
    for _ in 0..5 {
        let data = client.fetch(&addr).await.unwrap();
        assert_eq!(&data[..], &content[..]);
    }

    let stats = wait_for_stats(&server, |s| s.completed == 5).await;
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.failed, 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_empty_file_closes_immediately() {
    init_tracing();
    let file = fixture(&[]);
    let (mut server, addr) = start_server(local_options(file.path())).await;

    let data = FileRelayClient::default().fetch(&addr).await.unwrap();
    assert!(data.is_empty());

    let stats = wait_for_stats(&server, |s| s.completed == 1).await;
    assert_eq!(stats.bytes_sent, 0);

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients() {
    init_tracing();
    let content = pattern(256 * 1024);
    let file = fixture(&content);
    let mut options = local_options(file.path());
    options.max_workers = 4;
    let (mut server, addr) = start_server(options).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let addr = addr.clone();
        handles.push(tokio::spawn(async move {
            FileRelayClient::default().fetch(&addr).await
        }));
    }
    for handle in handles {
        let data = handle.await.unwrap().unwrap();
        assert_eq!(data.len(), content.len());
        assert_eq!(&data[..], &content[..]);
    }

    let stats = wait_for_stats(&server, |s| s.completed == 16).await;
    assert_eq!(stats.accepted, 16);
    assert_eq!(stats.completed, 16);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_missing_file_does_not_stop_listener() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("restart_script.sh");
    let (mut server, addr) = start_server(local_options(&path)).await;

    // The worker fails to open the file and drops the connection.
    let client = FileRelayClient::default();
    let data = client.fetch(&addr).await.unwrap();
    assert!(data.is_empty());
    let stats = wait_for_stats(&server, |s| s.failed == 1).await;
    assert_eq!(stats.failed, 1);

    // Every worker opens the file afresh, so the next client gets it.
    std::fs::write(&path, b"#!/bin/sh\necho restarted\n").unwrap();
    let data = client.fetch(&addr).await.unwrap();
    assert_eq!(&data[..], b"#!/bin/sh\necho restarted\n");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_cancels_stalled_transfer() {
    init_tracing();
    // Larger than the loopback socket buffers, so the worker blocks on write.
    let file = fixture(&vec![7u8; 64 * 1024 * 1024]);
    let mut options = local_options(file.path());
    options.shutdown_grace = Duration::from_millis(200);
    let (mut server, addr) = start_server(options).await;

    let mut stalled = TcpStream::connect(&addr).await.unwrap();
    wait_for_stats(&server, |s| s.accepted == 1).await;
    time::sleep(Duration::from_millis(200)).await;

    time::timeout(Duration::from_secs(10), server.stop())
        .await
        .expect("stop did not finish")
        .unwrap();

    let stats = server.stats();
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.failed, 1);

    // The peer sees a truncated stream followed by close.
    let mut received = Vec::new();
    let _ = time::timeout(Duration::from_secs(10), stalled.read_to_end(&mut received)).await;
    assert!(received.len() < 64 * 1024 * 1024);
}

#[tokio::test]
async fn test_client_read_timeout_against_stalled_server() {
    init_tracing();
    // A plain listener that accepts but never writes.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let holder = tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        time::sleep(Duration::from_secs(5)).await;
    });

    let client = FileRelayClient::new(TimeoutOptions {
        read_timeout: Some(Duration::from_millis(100)),
        ..TimeoutOptions::default()
    });
    assert!(client.fetch(&addr).await.is_err());
    holder.abort();
}

#[tokio::test]
async fn test_stop_drains_running_and_queued_transfers() {
    init_tracing();
    let content = pattern(8 * 1024 * 1024);
    let file = fixture(&content);
    let mut options = local_options(file.path());
    // One worker: the second client waits in the queue while the first is served.
    options.max_workers = 1;
    let (mut server, addr) = start_server(options).await;

    let mut handles = Vec::new();
    for _ in 0..2 {
        let addr = addr.clone();
        handles.push(tokio::spawn(async move {
            FileRelayClient::default().fetch(&addr).await
        }));
    }
    wait_for_stats(&server, |s| s.accepted == 2).await;

    time::timeout(Duration::from_secs(10), server.stop())
        .await
        .expect("stop did not finish")
        .unwrap();

    for handle in handles {
        let data = handle.await.unwrap().unwrap();
        assert_eq!(data.len(), content.len());
        assert_eq!(&data[..], &content[..]);
    }
    let stats = server.stats();
    assert_eq!(stats.accepted, 2);
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn test_counters_add_up_after_forced_stop() {
    init_tracing();
    let file = fixture(&vec![3u8; 64 * 1024 * 1024]);
    let mut options = local_options(file.path());
    options.max_workers = 1;
    options.max_pending = 1;
    options.shutdown_grace = Duration::from_millis(200);
    let (mut server, addr) = start_server(options).await;

    // None of these peers read: one is served, one is queued and the last one
    // leaves the listener waiting for queue space.
    let mut peers = Vec::new();
    for _ in 0..3 {
        peers.push(TcpStream::connect(&addr).await.unwrap());
    }
    let stats = wait_for_stats(&server, |s| s.accepted == 3).await;
    assert_eq!(stats.accepted, 3);

    time::timeout(Duration::from_secs(10), server.stop())
        .await
        .expect("stop did not finish")
        .unwrap();

    let stats = server.stats();
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.accepted, stats.completed + stats.failed);
    drop(peers);
}

#[tokio::test]
async fn test_port_can_be_rebound_after_stop() {
    init_tracing();
    let content = pattern(4096);
    let file = fixture(&content);
    let (mut server, addr) = start_server(local_options(file.path())).await;
    let data = FileRelayClient::default().fetch(&addr).await.unwrap();
    assert_eq!(&data[..], &content[..]);
    server.stop().await.unwrap();

    // The served connection lingers in TIME_WAIT; address reuse lets a new server bind.
    let bound: SocketAddr = addr.parse().unwrap();
    let options = ServerOptions::new("127.0.0.1", bound.port(), file.path());
    let (mut rebound, rebound_addr) = start_server(options).await;
    assert_eq!(rebound_addr, addr);

    let data = FileRelayClient::default().fetch(&rebound_addr).await.unwrap();
    assert_eq!(&data[..], &content[..]);
    rebound.stop().await.unwrap();
}
