// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for dispatch loop integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use berth_dispatch::{
    Connection, DispatchConfig, DispatchError, DispatchLoop, DispatchThread, LifecycleHooks,
    Listener, Request, RequestHandler,
};
use berth_protocol::channel::encode_scalar;
use berth_protocol::session::encode_headers;
use berth_protocol::{Headers, ServerAddress};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub address: ServerAddress,
    pub thread: DispatchThread,
}

/// Start a dispatch loop on a free TCP port.
pub fn start_server(
    config: DispatchConfig,
    handler: Arc<dyn RequestHandler>,
    hooks: Arc<dyn LifecycleHooks>,
) -> TestServer {
    let listener = Listener::bind(&ServerAddress::tcp("127.0.0.1", 0)).unwrap();
    let address = listener.local_address().unwrap();
    let thread = DispatchLoop::new(listener, config, handler)
        .with_hooks(hooks)
        .spawn()
        .unwrap();
    TestServer { address, thread }
}

/// Wire form of a session request
pub fn session_request(pairs: &[(&str, &str)]) -> Vec<u8> {
    let block = encode_headers(pairs.iter().copied());
    encode_scalar(&block).unwrap().to_vec()
}

pub async fn connect(address: &ServerAddress) -> Connection {
    Connection::connect(address).await.unwrap()
}

/// Send one request on a fresh connection and read until the server closes it.
pub async fn round_trip(address: &ServerAddress, request: &[u8]) -> Vec<u8> {
    let mut connection = connect(address).await;
    connection.write_all(request).await.unwrap();
    read_to_close(&mut connection).await
}

/// Read until end-of-stream. A reset counts as the end; the server may close
/// with unread request bytes still queued.
pub async fn read_to_close(connection: &mut Connection) -> Vec<u8> {
    let mut response = Vec::new();
    let result = tokio::time::timeout(TIMEOUT, connection.read_to_end(&mut response))
        .await
        .expect("server did not close the connection");
    match result {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {}
        Err(e) => panic!("read failed: {e}"),
    }
    response
}

pub async fn read_exactly(connection: &mut Connection, len: usize) -> Vec<u8> {
    let mut response = vec![0u8; len];
    tokio::time::timeout(TIMEOUT, connection.read_exact(&mut response))
        .await
        .expect("server did not answer")
        .unwrap();
    response
}

/// Poll `condition` until it holds or the test timeout passes.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Writes a fixed body and keeps the connection alive when allowed.
pub struct FixedResponder(pub &'static str);

#[async_trait]
impl RequestHandler for FixedResponder {
    async fn process_request(&self, request: &mut Request) -> Result<(), DispatchError> {
        request.keepalive();
        if let Some(connection) = request.connection() {
            connection.write_all(self.0.as_bytes()).await?;
        }
        Ok(())
    }
}

/// Records every lifecycle callback.
#[derive(Default)]
pub struct RecordingHooks {
    pub thread_starts: AtomicUsize,
    pub prepared: Mutex<Vec<Headers>>,
    pub finalized: Mutex<Vec<bool>>,
    pub out_of_band_work: AtomicUsize,
}

impl LifecycleHooks for RecordingHooks {
    fn on_thread_start(&self) {
        self.thread_starts.fetch_add(1, Ordering::SeqCst);
    }

    fn on_prepare_request(&self, headers: &Headers) {
        self.prepared.lock().unwrap().push(headers.clone());
    }

    fn on_finalize_request(&self, _headers: &Headers, had_error: bool) {
        self.finalized.lock().unwrap().push(had_error);
    }

    fn on_out_of_band_work(&self) {
        self.out_of_band_work.fetch_add(1, Ordering::SeqCst);
    }
}
