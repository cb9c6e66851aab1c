// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Preloaded spawning: ask a long-lived preloader process to fork workers.
//!
//! The preloader is itself started through a [`Loader`] with
//! `spawn_method = "smart"` and publishes a `preloader` socket. Each spawn
//! sends one control line over that socket; the forked worker then performs
//! the same work directory handshake as a directly spawned one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use berth_protocol::control::{self, ControlRequest, ControlResponse, MAX_LINE_SIZE};
use berth_protocol::{ServerAddress, SocketProtocol};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::pipe;
use tracing::{debug, info};

use crate::args::{SPAWN_METHOD, SPAWN_METHOD_SMART, StartupArgs};
use crate::config::SpawnerConfig;
use crate::error::{ErrorCategory, SpawnError, SpawnErrorKind};
use crate::handshake::{self, FinishSignal, Pending};
use crate::loader::{self, Loader};
use crate::process::{AppProcess, InputHandle, ProcessWatch};
use crate::work_dir::WorkDir;

/// Client for a running preloader.
#[derive(Debug)]
pub struct Preloader {
    control: PathBuf,
    config: SpawnerConfig,
    process: Option<AppProcess>,
}

impl Preloader {
    /// Start a preloader through `loader` and locate its control socket.
    pub async fn start(loader: &Loader, args: &StartupArgs) -> Result<Self, SpawnError> {
        let args = args.clone().set(SPAWN_METHOD, SPAWN_METHOD_SMART);
        let process = loader.spawn(&args).await?;

        let Some(socket) = process.socket_by_protocol(SocketProtocol::Preloader) else {
            return Err(SpawnError::internal(
                "The preloader did not publish a socket with protocol \"preloader\"",
            )
            .with_pid(process.pid()));
        };
        let ServerAddress::Unix(control) = &socket.address else {
            return Err(SpawnError::internal(format!(
                "The preloader socket must be a Unix socket, got {}",
                socket.address
            ))
            .with_pid(process.pid()));
        };
        let control = control.clone();

        info!(pid = process.pid(), control = %control.display(), "Preloader started");
        Ok(Self {
            control,
            config: loader.config().clone(),
            process: Some(process),
        })
    }

    /// Use a preloader that someone else started and manages.
    pub fn connect(control: impl Into<PathBuf>, config: SpawnerConfig) -> Self {
        Self {
            control: control.into(),
            config,
            process: None,
        }
    }

    pub fn control_socket(&self) -> &Path {
        &self.control
    }

    /// The preloader process itself, when this client started it
    pub fn process(&mut self) -> Option<&mut AppProcess> {
        self.process.as_mut()
    }

    /// Ask the preloader for a new worker and wait for the worker's handshake.
    pub async fn spawn(&self, args: &StartupArgs) -> Result<AppProcess, SpawnError> {
        let work_dir = WorkDir::create(&self.config.spawn_dir).map_err(|e| {
            SpawnError::internal(format!(
                "Cannot create a work directory in {}: {e}",
                self.config.spawn_dir.display()
            ))
            .with_category(ErrorCategory::FileSystem)
        })?;
        work_dir.write_args(args)?;
        let stdin = work_dir.create_stdin_fifo()?;
        // Read-write so opening does not wait for the worker to show up.
        let input = pipe::OpenOptions::new()
            .read_write(true)
            .open_sender(&stdin)?;
        let mut finish = FinishSignal::open(&work_dir)?;

        let pid = self.request_spawn(work_dir.path()).await?;
        debug!(pid, work_dir = %work_dir.path().display(), "Preloader forked worker");

        let mut pending = Pending {
            pid,
            watch: ProcessWatch::foreign(pid),
            input: Some(InputHandle::Fifo(input)),
            output: None,
        };
        let outcome = handshake::wait_for_finish(&mut finish, &mut pending.watch).await?;
        handshake::conclude(&work_dir, outcome, pending, &self.config).await
    }

    /// [`Preloader::spawn`] bounded by `timeout`.
    ///
    /// On expiry a [`SpawnErrorKind::Timeout`] error is returned. The forked
    /// worker is not our child; closing its stdin FIFO is what tells it to go.
    pub async fn spawn_with_timeout(
        &self,
        args: &StartupArgs,
        timeout: Duration,
    ) -> Result<AppProcess, SpawnError> {
        loader::within(timeout, self.spawn(args)).await
    }

    async fn request_spawn(&self, work_dir: &Path) -> Result<i32, SpawnError> {
        let preloader_error = |what: String| {
            SpawnError::internal(what).with_category(ErrorCategory::Io)
        };

        let stream = UnixStream::connect(&self.control).await.map_err(|e| {
            preloader_error(format!(
                "Cannot connect to the preloader at {}: {e}",
                self.control.display()
            ))
        })?;
        let (read_half, mut write_half) = stream.into_split();

        let request = control::encode_line(&ControlRequest::Spawn {
            work_dir: work_dir.to_path_buf(),
        })
        .map_err(|e| preloader_error(e.to_string()))?;
        write_half
            .write_all(&request)
            .await
            .map_err(|e| preloader_error(format!("Cannot send the spawn command to the preloader: {e}")))?;

        let mut reader = BufReader::new(read_half);
        let line = control::read_line(&mut reader, MAX_LINE_SIZE)
            .await
            .map_err(|e| preloader_error(format!("Cannot read the preloader response: {e}")))?
            .ok_or_else(|| {
                preloader_error("The preloader closed the connection without responding".to_string())
            })?;

        let response: ControlResponse = control::decode_line(&line).map_err(|e| {
            preloader_error("The preloader sent an invalid response".to_string())
                .with_problem_description(format!("{e}: {line}"))
        })?;

        match response {
            ControlResponse::Ok { pid } if pid > 0 => Ok(pid),
            ControlResponse::Ok { pid } => Err(preloader_error(format!(
                "The preloader responded with an invalid PID {pid}"
            ))),
            ControlResponse::Error { message } => Err(SpawnError::new(
                SpawnErrorKind::Error,
                format!("The preloader failed to spawn a process: {message}"),
            )
            .with_category(ErrorCategory::OperatingSystem)),
        }
    }

    /// Stop the preloader (if this client started it) by closing its stdin.
    pub async fn shutdown(mut self, grace: Duration) -> std::io::Result<()> {
        if let Some(process) = self.process.take() {
            process.shutdown(grace).await?;
        }
        Ok(())
    }
}
