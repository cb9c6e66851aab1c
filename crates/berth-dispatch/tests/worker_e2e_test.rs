// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Spawning workers and talking to them: the full path from the spawn
//! handshake to a served request.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use berth_dispatch::{DispatchConfig, NoHooks};
use berth_protocol::{ServerAddress, SocketInfo, SocketProtocol};
use berth_spawn::args::{CONNECT_PASSWORD, KEEPALIVE, LISTEN, PROTOCOL, SOCKET_DIR, THREADS};
use berth_spawn::{Loader, Preloader, SpawnErrorKind, SpawnerConfig, StartupArgs};
use common::*;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

const SPAWN_TIMEOUT: Duration = Duration::from_secs(30);
const GRACE: Duration = Duration::from_secs(5);

const RESPONSE_BODY: &str = "Hello from berth-worker\n";

fn worker_loader(spawn_dir: &Path) -> Loader {
    Loader::new(
        vec![env!("CARGO_BIN_EXE_berth-worker").to_string()],
        SpawnerConfig::default().with_spawn_dir(spawn_dir),
    )
    .unwrap()
}

fn ping() -> Vec<u8> {
    session_request(&[("REQUEST_METHOD", "PING")])
}

// ========== Script worker ==========

#[tokio::test]
async fn test_script_worker_publishes_dispatch_socket() {
    let server = start_server(
        DispatchConfig::new(),
        Arc::new(FixedResponder("app")),
        Arc::new(NoHooks),
    );

    let script = r#"
dir="$BERTH_SPAWN_WORK_DIR"
address=$(cat "$dir/args/listen")
printf '{"sockets":[{"name":"main","address":"%s","protocol":"session","accept_http_requests":true}]}' "$address" > "$dir/response/properties.json"
printf 1 > "$dir/response/finish"
exec cat > /dev/null
"#;
    let spawn_dir = TempDir::new().unwrap();
    let loader = Loader::new(
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
        SpawnerConfig::default().with_spawn_dir(spawn_dir.path()),
    )
    .unwrap();
    let args = StartupArgs::new().set(LISTEN, server.address.to_string());

    let process = loader.spawn_with_timeout(&args, SPAWN_TIMEOUT).await.unwrap();
    let expected = SocketInfo::new("main", server.address.clone(), SocketProtocol::Session)
        .accepting_http_requests();
    assert_eq!(process.sockets(), &[expected]);

    let address = &process.sockets()[0].address;
    assert_eq!(round_trip(address, &ping()).await, b"pong");

    assert_eq!(process.shutdown(GRACE).await.unwrap(), Some(0));
    server.thread.interrupt();
    server.thread.join().unwrap();
}

// ========== berth-worker via Loader ==========

#[tokio::test]
async fn test_worker_serves_session_requests() {
    let spawn_dir = TempDir::new().unwrap();
    let socket_dir = TempDir::new().unwrap();
    let loader = worker_loader(spawn_dir.path());
    let args = StartupArgs::new()
        .set(SOCKET_DIR, socket_dir.path().to_string_lossy().to_string())
        .set(THREADS, 2);

    let process = loader.spawn_with_timeout(&args, SPAWN_TIMEOUT).await.unwrap();
    let socket = process.socket("main").unwrap().clone();
    assert_eq!(socket.protocol, SocketProtocol::Session);
    assert_eq!(socket.concurrency, 2);
    assert!(socket.accept_http_requests);
    let socket_path = socket.address.unix_path().unwrap().to_path_buf();
    assert!(socket_path.starts_with(socket_dir.path()));

    assert_eq!(round_trip(&socket.address, &ping()).await, b"pong");

    let oobw = session_request(&[("REQUEST_METHOD", "OOBW")]);
    assert_eq!(round_trip(&socket.address, &oobw).await, b"oobw done");

    let get = session_request(&[("REQUEST_METHOD", "GET"), ("PATH_INFO", "/")]);
    let response = String::from_utf8(round_trip(&socket.address, &get).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with(RESPONSE_BODY));

    // Closing stdin shuts the worker down cleanly.
    assert_eq!(process.shutdown(GRACE).await.unwrap(), Some(0));
    assert!(!socket_path.exists());
}

#[tokio::test]
async fn test_worker_publishes_http_socket() {
    let spawn_dir = TempDir::new().unwrap();
    let socket_dir = TempDir::new().unwrap();
    let loader = worker_loader(spawn_dir.path());
    let args = StartupArgs::new()
        .set(SOCKET_DIR, socket_dir.path().to_string_lossy().to_string())
        .set(THREADS, 3);

    let process = loader.spawn_with_timeout(&args, SPAWN_TIMEOUT).await.unwrap();
    assert_eq!(process.sockets().len(), 2);
    assert_eq!(process.socket("main").unwrap().protocol, SocketProtocol::Session);

    let http = process.socket("http").unwrap().clone();
    assert_eq!(http.protocol, SocketProtocol::Http);
    assert_eq!(http.concurrency, 1);
    assert!(!http.accept_http_requests);
    assert!(matches!(http.address, ServerAddress::Tcp(ref a) if a.starts_with("127.0.0.1:")));

    let response = round_trip(&http.address, b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Connection: close\r\n"));
    assert!(response.ends_with(RESPONSE_BODY));

    let ping = round_trip(&http.address, b"PING / HTTP/1.1\r\n\r\n").await;
    assert_eq!(ping, b"pong");

    assert_eq!(process.shutdown(GRACE).await.unwrap(), Some(0));
}

#[tokio::test]
async fn test_worker_http_keepalive() {
    let spawn_dir = TempDir::new().unwrap();
    let loader = worker_loader(spawn_dir.path());
    let args = StartupArgs::new()
        .set(LISTEN, "tcp://127.0.0.1:0")
        .set(PROTOCOL, "http")
        .set(KEEPALIVE, true);

    let process = loader.spawn_with_timeout(&args, SPAWN_TIMEOUT).await.unwrap();
    let socket = process.socket("main").unwrap().clone();
    assert_eq!(socket.protocol, SocketProtocol::Http);
    assert!(matches!(socket.address, ServerAddress::Tcp(ref a) if !a.ends_with(":0")));

    let expected = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n{}",
        RESPONSE_BODY.len(),
        RESPONSE_BODY
    );
    let mut connection = connect(&socket.address).await;
    for _ in 0..2 {
        connection
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let response = read_exactly(&mut connection, expected.len()).await;
        assert_eq!(String::from_utf8(response).unwrap(), expected);
    }
    drop(connection);

    assert_eq!(process.shutdown(GRACE).await.unwrap(), Some(0));
}

#[tokio::test]
async fn test_worker_password_required() {
    let spawn_dir = TempDir::new().unwrap();
    let socket_dir = TempDir::new().unwrap();
    let loader = worker_loader(spawn_dir.path());
    let args = StartupArgs::new()
        .set(SOCKET_DIR, socket_dir.path().to_string_lossy().to_string())
        .set(CONNECT_PASSWORD, "s3cret");

    let process = loader.spawn_with_timeout(&args, SPAWN_TIMEOUT).await.unwrap();
    let address = process.socket("main").unwrap().address.clone();

    assert!(round_trip(&address, &ping()).await.is_empty());
    let authorized = session_request(&[
        ("REQUEST_METHOD", "PING"),
        ("BERTH_CONNECT_PASSWORD", "s3cret"),
    ]);
    assert_eq!(round_trip(&address, &authorized).await, b"pong");

    process.shutdown(GRACE).await.unwrap();
}

#[tokio::test]
async fn test_worker_reports_startup_error() {
    let spawn_dir = TempDir::new().unwrap();
    let loader = worker_loader(spawn_dir.path());
    let args = StartupArgs::new().set(PROTOCOL, "gopher");

    let err = loader
        .spawn_with_timeout(&args, SPAWN_TIMEOUT)
        .await
        .unwrap_err();
    assert_eq!(err.kind, SpawnErrorKind::Error);
    assert_eq!(err.summary, "berth-worker failed to start");
    assert!(err.problem_description.unwrap().contains("gopher"));
}

// ========== berth-worker as preloader ==========

#[tokio::test]
async fn test_preloader_forks_workers() {
    let spawn_dir = TempDir::new().unwrap();
    let socket_dir = TempDir::new().unwrap();
    let loader = worker_loader(spawn_dir.path());
    let args =
        StartupArgs::new().set(SOCKET_DIR, socket_dir.path().to_string_lossy().to_string());

    let mut preloader = Preloader::start(&loader, &args).await.unwrap();
    assert!(preloader.control_socket().starts_with(socket_dir.path()));
    let preloader_pid = preloader.process().unwrap().pid();

    let first = preloader.spawn(&args).await.unwrap();
    let second = preloader.spawn(&args).await.unwrap();
    assert_ne!(first.pid(), preloader_pid);
    assert_ne!(first.pid(), second.pid());
    assert_ne!(
        first.socket("main").unwrap().address,
        second.socket("main").unwrap().address
    );

    for worker in [&first, &second] {
        let address = &worker.socket("main").unwrap().address;
        assert_eq!(round_trip(address, &ping()).await, b"pong");
    }

    // Forked workers are not our children; they exit when their input closes.
    first.shutdown(GRACE).await.unwrap();
    second.shutdown(GRACE).await.unwrap();

    let control = preloader.control_socket().to_path_buf();
    preloader.shutdown(GRACE).await.unwrap();
    assert!(!control.exists());
}
