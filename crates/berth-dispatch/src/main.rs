// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! berth-worker - a minimal loader program
//!
//! Performs the worker side of the spawn handshake, then serves requests
//! until stdin is closed: the `main` socket gets `threads` dispatch loops and
//! a plain HTTP socket on `127.0.0.1` gets one. `PING` and `OOBW` are
//! answered by the loops; any other request gets a small static HTTP
//! response.
//!
//! With `spawn_method = "smart"` it starts as a preloader instead: it
//! publishes a control socket and forks a worker for every spawn command.
//!
//! Startup arguments used:
//! - `protocol`: `session` (default) or `http`
//! - `connect_password`: secret required on every request
//! - `keepalive`: allow several requests per connection
//! - `threads`: number of dispatch loops (default 1)
//! - `listen`: address to bind, e.g. `tcp://127.0.0.1:0`
//! - `socket_dir`: where Unix sockets are created when `listen` is absent

use std::io::Read;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use berth_dispatch::{
    DispatchConfig, DispatchError, DispatchLoop, DispatchThread, Listener, Protocol, Request,
    RequestHandler,
};
use berth_protocol::{ServerAddress, SocketInfo, SocketProtocol};
use berth_spawn::args::{LISTEN, SOCKET_DIR, THREADS};
use berth_spawn::fork_server::{self, ServeOutcome};
use berth_spawn::{ErrorCategory, ErrorReport, WorkerHandshake};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const RESPONSE_BODY: &str = "Hello from berth-worker\n";

/// Name of the plain HTTP socket every worker publishes next to its main one
const HTTP_SOCKET: &str = "http";

fn main() -> anyhow::Result<()> {
    // Initialize logging; stdout is left to the application
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "berth_worker=info,berth_dispatch=info,berth_spawn=info".into()),
        )
        .init();

    if let Err(e) = dotenvy::dotenv() {
        debug!("No .env file loaded: {}", e);
    }

    let mut handshake =
        WorkerHandshake::from_env().context("berth-worker must be started by a spawner")?;

    if handshake.args().is_smart() {
        let (listener, socket_path) = reported(&handshake, start_preloader(&handshake))?;
        match fork_server::serve(listener)? {
            ServeOutcome::Shutdown => {
                remove_socket(&socket_path);
                return Ok(());
            }
            ServeOutcome::Forked { work_dir } => {
                handshake = WorkerHandshake::open(&work_dir)
                    .with_context(|| format!("opening work directory {}", work_dir.display()))?;
            }
        }
    }

    let server = reported(&handshake, start_server(&handshake))?;
    info!(pid = std::process::id(), "Worker ready");

    wait_for_input_eof();
    info!("Input closed, shutting down");
    server.shutdown()
}

/// Report a startup failure through the work directory before returning it.
fn reported<T>(handshake: &WorkerHandshake, result: anyhow::Result<T>) -> anyhow::Result<T> {
    if let Err(e) = &result {
        let message = format!("{e:#}");
        error!(error = %message, "Worker failed to start");
        let report = ErrorReport::new("berth-worker failed to start")
            .with_category(ErrorCategory::Internal)
            .with_problem_description(message)
            .with_advanced_problem_details(format!("{e:?}"));
        if let Err(report_err) = handshake.report_error(&report) {
            warn!(error = %report_err, "Failed to report startup error");
        }
    }
    result
}

fn socket_dir(handshake: &WorkerHandshake) -> PathBuf {
    handshake
        .args()
        .get_str(SOCKET_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        debug!(path = %path.display(), error = %e, "Failed to remove socket file");
    }
}

fn start_preloader(handshake: &WorkerHandshake) -> anyhow::Result<(UnixListener, PathBuf)> {
    let path = socket_dir(handshake).join(format!("preloader.{}", Uuid::new_v4().simple()));
    let listener = UnixListener::bind(&path)
        .with_context(|| format!("binding preloader socket {}", path.display()))?;

    let socket = SocketInfo::new(
        "preloader",
        ServerAddress::unix(path.clone()),
        SocketProtocol::Preloader,
    );
    handshake.advertise_sockets(&[socket])?;
    handshake.advertise_readiness()?;
    info!(socket = %path.display(), "Preloader ready");
    Ok((listener, path))
}

struct Server {
    threads: Vec<DispatchThread>,
    socket_path: Option<PathBuf>,
}

fn start_server(handshake: &WorkerHandshake) -> anyhow::Result<Server> {
    let args = handshake.args();
    let config = DispatchConfig::from_args(args)?;
    let threads = match args.get(THREADS) {
        None => 1,
        Some(_) => match args.get_u64(THREADS) {
            Some(n) if n > 0 => n,
            _ => bail!("invalid value for {THREADS}: {:?}", args.get(THREADS)),
        },
    };

    let address = match args.get_str(LISTEN) {
        Some(listen) => listen.parse::<ServerAddress>()?,
        None => ServerAddress::unix(
            socket_dir(handshake).join(format!("worker.{}", Uuid::new_v4().simple())),
        ),
    };
    let listener =
        Listener::bind(&address).with_context(|| format!("binding worker socket {address}"))?;
    let address = listener.local_address()?;

    let http_listener = Listener::bind(&ServerAddress::tcp("127.0.0.1", 0))
        .context("binding HTTP socket")?;
    let http_address = http_listener.local_address()?;
    let http_config = config
        .clone()
        .with_socket_name(HTTP_SOCKET)
        .with_protocol(Protocol::Http);

    let handler: Arc<dyn RequestHandler> = Arc::new(StaticResponder);
    let mut loops = spawn_loops(listener, &config, &handler, threads)?;
    loops.extend(spawn_loops(http_listener, &http_config, &handler, 1)?);

    let sockets = [
        SocketInfo::new(
            config.socket_name.clone(),
            address.clone(),
            config.protocol.socket_protocol(),
        )
        .with_concurrency(i32::try_from(threads).unwrap_or(i32::MAX))
        .accepting_http_requests(),
        SocketInfo::new(HTTP_SOCKET, http_address.clone(), SocketProtocol::Http),
    ];
    handshake.advertise_sockets(&sockets)?;
    handshake.advertise_readiness()?;

    info!(
        address = %address,
        http_address = %http_address,
        protocol = config.protocol.as_str(),
        threads,
        "Serving requests"
    );
    Ok(Server {
        threads: loops,
        socket_path: address.unix_path().map(Path::to_path_buf),
    })
}

/// Start `count` dispatch loops sharing `listener`.
fn spawn_loops(
    listener: Listener,
    config: &DispatchConfig,
    handler: &Arc<dyn RequestHandler>,
    count: u64,
) -> anyhow::Result<Vec<DispatchThread>> {
    let mut loops = Vec::new();
    for _ in 0..count {
        let dispatch = DispatchLoop::new(listener.try_clone()?, config.clone(), handler.clone());
        loops.push(dispatch.spawn()?);
    }
    Ok(loops)
}

impl Server {
    fn shutdown(self) -> anyhow::Result<()> {
        for thread in &self.threads {
            thread.interrupt();
        }
        let mut failed = 0;
        for thread in self.threads {
            if let Err(e) = thread.join() {
                error!(error = %e, "Dispatch loop failed");
                failed += 1;
            }
        }
        if let Some(path) = &self.socket_path {
            remove_socket(path);
        }
        if failed > 0 {
            bail!("{failed} dispatch loop(s) failed");
        }
        Ok(())
    }
}

/// Block until stdin is closed by the spawner.
fn wait_for_input_eof() {
    let mut stdin = std::io::stdin().lock();
    let mut buf = [0u8; 256];
    loop {
        match stdin.read(&mut buf) {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!(error = %e, "Failed to read stdin");
                return;
            }
        }
    }
}

/// Answers every request with a fixed HTTP response.
struct StaticResponder;

#[async_trait]
impl RequestHandler for StaticResponder {
    async fn process_request(&self, request: &mut Request) -> Result<(), DispatchError> {
        if request.headers().contains_key(berth_dispatch::request::CONTENT_LENGTH) {
            if let Some(mut body) = request.body() {
                tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
            }
        }

        let keepalive = request.keepalive();
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n",
            RESPONSE_BODY.len()
        );
        if request.full_http_response() {
            response.push_str(if keepalive {
                "Connection: keep-alive\r\n"
            } else {
                "Connection: close\r\n"
            });
        }
        response.push_str("\r\n");
        response.push_str(RESPONSE_BODY);

        if let Some(connection) = request.connection() {
            connection.write_all(response.as_bytes()).await?;
            connection.flush().await?;
        }
        Ok(())
    }
}
