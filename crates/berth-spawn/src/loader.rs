// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Direct spawning: start a loader program as our child and wait for its
//! handshake.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::args::StartupArgs;
use crate::config::SpawnerConfig;
use crate::error::{ErrorCategory, SpawnError, SpawnErrorKind};
use crate::handshake::{self, FinishSignal, Pending};
use crate::process::{AppProcess, InputHandle, OutputCapture, ProcessWatch};
use crate::work_dir::{WORK_DIR_ENV, WorkDir};

/// Starts application processes by running a loader command.
#[derive(Debug, Clone)]
pub struct Loader {
    command: Vec<String>,
    config: SpawnerConfig,
}

impl Loader {
    /// `command` is the program and its arguments.
    pub fn new(command: Vec<String>, config: SpawnerConfig) -> Result<Self, SpawnError> {
        if command.is_empty() {
            return Err(SpawnError::internal("The loader command is empty"));
        }
        Ok(Self { command, config })
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn config(&self) -> &SpawnerConfig {
        &self.config
    }

    /// Start one worker and wait until it finishes its handshake, fails or
    /// exits.
    ///
    /// No timeout applies here; see [`Loader::spawn_with_timeout`].
    pub async fn spawn(&self, args: &StartupArgs) -> Result<AppProcess, SpawnError> {
        let work_dir = WorkDir::create(&self.config.spawn_dir).map_err(|e| {
            SpawnError::internal(format!(
                "Cannot create a work directory in {}: {e}",
                self.config.spawn_dir.display()
            ))
            .with_category(ErrorCategory::FileSystem)
        })?;
        work_dir.write_args(args).map_err(|e| {
            SpawnError::internal(format!("Cannot write startup arguments: {e}"))
                .with_category(ErrorCategory::FileSystem)
        })?;
        let mut finish = FinishSignal::open(&work_dir)?;

        let program = &self.command[0];
        let mut command = Command::new(program);
        command
            .args(&self.command[1..])
            .env(WORK_DIR_ENV, work_dir.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(app_root) = args.app_root()
            && Path::new(app_root).is_dir()
        {
            command.current_dir(app_root);
        }

        let mut child = command.spawn().map_err(|e| {
            SpawnError::internal(format!("Cannot start the loader {program}: {e}"))
                .with_category(ErrorCategory::OperatingSystem)
        })?;
        let pid = child
            .id()
            .map(|id| id as i32)
            .ok_or_else(|| SpawnError::internal("The loader exited before it could be tracked"))?;
        debug!(pid, program = %program, work_dir = %work_dir.path().display(), "Loader started");

        let input = child.stdin.take().map(InputHandle::Pipe);
        let output = OutputCapture::start(child.stderr.take(), pid, self.config.max_output);
        let mut pending = Pending {
            pid,
            watch: ProcessWatch::Child(child),
            input,
            output: Some(output),
        };

        let outcome = handshake::wait_for_finish(&mut finish, &mut pending.watch).await?;
        handshake::conclude(&work_dir, outcome, pending, &self.config).await
    }

    /// [`Loader::spawn`] bounded by `timeout`.
    ///
    /// On expiry the starting process is killed, its work directory removed
    /// and a [`SpawnErrorKind::Timeout`] error returned.
    pub async fn spawn_with_timeout(
        &self,
        args: &StartupArgs,
        timeout: Duration,
    ) -> Result<AppProcess, SpawnError> {
        within(timeout, self.spawn(args)).await
    }
}

/// Bound a spawn by `timeout`, turning expiry into a timeout error.
pub(crate) async fn within<F>(timeout: Duration, spawn: F) -> Result<AppProcess, SpawnError>
where
    F: Future<Output = Result<AppProcess, SpawnError>>,
{
    match tokio::time::timeout(timeout, spawn).await {
        Ok(result) => result,
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "Spawn timed out");
            Err(SpawnError::new(
                SpawnErrorKind::Timeout,
                format!(
                    "The application process did not finish starting within {} ms",
                    timeout.as_millis()
                ),
            )
            .with_category(ErrorCategory::Timeout))
        }
    }
}
