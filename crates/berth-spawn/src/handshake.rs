// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Spawner side of the work directory handshake, shared by the loader and
//! the preloader client.

use std::io;

use berth_protocol::SocketInfo;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tracing::{debug, info, warn};

use crate::config::SpawnerConfig;
use crate::error::{ErrorCategory, SpawnError, SpawnErrorKind};
use crate::process::{AppProcess, InputHandle, OutputCapture, ProcessWatch};
use crate::work_dir::WorkDir;

/// Read end of `response/finish`.
///
/// Opened read-write so that opening never blocks and the FIFO never reports
/// end-of-file while we hold it.
pub(crate) struct FinishSignal {
    receiver: pipe::Receiver,
}

impl FinishSignal {
    pub(crate) fn open(work_dir: &WorkDir) -> io::Result<Self> {
        let receiver = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(work_dir.layout().finish_fifo())?;
        Ok(Self { receiver })
    }

    /// Wait for the first byte the worker writes. Cancel safe.
    async fn read_byte(&mut self) -> io::Result<u8> {
        let mut byte = [0u8; 1];
        self.receiver.read_exact(&mut byte).await?;
        Ok(byte[0])
    }

    /// A byte that is already waiting, if any
    fn try_read_byte(&self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.receiver.try_read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FinishOutcome {
    /// The worker wrote '1'
    Ready,
    /// The worker wrote something other than '1'
    Failed(u8),
    /// The process exited without writing anything
    Exited(Option<i32>),
}

/// Wait until the worker signals through the finish FIFO or exits.
///
/// A signal written just before exit still counts as a signal.
pub(crate) async fn wait_for_finish(
    signal: &mut FinishSignal,
    watch: &mut ProcessWatch,
) -> io::Result<FinishOutcome> {
    tokio::select! {
        biased;

        byte = signal.read_byte() => Ok(classify(byte?)),
        status = watch.wait() => {
            let exit_code = status?;
            match signal.try_read_byte()? {
                Some(byte) => Ok(classify(byte)),
                None => Ok(FinishOutcome::Exited(exit_code)),
            }
        }
    }
}

fn classify(byte: u8) -> FinishOutcome {
    if byte == b'1' {
        FinishOutcome::Ready
    } else {
        FinishOutcome::Failed(byte)
    }
}

/// The properties document a worker publishes on success
#[derive(Debug, Deserialize)]
struct PropertiesDocument {
    sockets: Vec<SocketInfo>,
    #[serde(flatten)]
    other: Map<String, Value>,
}

/// Everything the spawner holds for a worker whose handshake is in progress
pub(crate) struct Pending {
    pub(crate) pid: i32,
    pub(crate) watch: ProcessWatch,
    pub(crate) input: Option<InputHandle>,
    pub(crate) output: Option<OutputCapture>,
}

/// Turn a finish outcome into a process handle or a spawn error.
///
/// On failure the worker is killed; the work directory is removed when the
/// caller drops it.
pub(crate) async fn conclude(
    work_dir: &WorkDir,
    outcome: FinishOutcome,
    mut pending: Pending,
    config: &SpawnerConfig,
) -> Result<AppProcess, SpawnError> {
    let pid = pending.pid;
    let result = match outcome {
        FinishOutcome::Ready => load_properties(work_dir, config).await,
        FinishOutcome::Failed(byte) => {
            debug!(pid, byte, "Worker reported startup failure");
            Err(reported_error(work_dir, config, SpawnErrorKind::Error, None).await)
        }
        FinishOutcome::Exited(exit_code) => {
            debug!(pid, ?exit_code, "Worker exited before finishing its handshake");
            Err(reported_error(work_dir, config, SpawnErrorKind::PrematureExit, exit_code).await)
        }
    };

    match result {
        Ok((sockets, properties)) => {
            if let Some(output) = &pending.output {
                output.detach();
            }
            info!(pid, sockets = sockets.len(), "Worker started");
            Ok(AppProcess::new(
                pid,
                pending.input.take(),
                sockets,
                properties,
                pending.watch,
            ))
        }
        Err(mut err) => {
            if let Err(e) = pending.watch.kill() {
                warn!(pid, error = %e, "Failed to kill worker after failed spawn");
            }
            pending.input = None;
            if let Some(output) = pending.output.as_mut() {
                err.output = output.collect().await;
            }
            warn!(pid, kind = %err.kind, summary = %err.summary, "Spawn failed");
            Err(err.with_pid(pid))
        }
    }
}

async fn reported_error(
    work_dir: &WorkDir,
    config: &SpawnerConfig,
    kind: SpawnErrorKind,
    exit_code: Option<i32>,
) -> SpawnError {
    let report = match work_dir
        .layout()
        .read_error_report(config.max_file_size)
        .await
    {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, "Failed to read worker error report");
            Default::default()
        }
    };

    let summary = report.summary.unwrap_or_else(|| match (kind, exit_code) {
        (SpawnErrorKind::PrematureExit, Some(code)) => {
            format!("The application process exited prematurely with exit code {code}")
        }
        (SpawnErrorKind::PrematureExit, None) => {
            "The application process exited prematurely".to_string()
        }
        _ => "The application process reported a startup failure".to_string(),
    });

    let mut err = SpawnError::new(kind, summary)
        .with_category(report.category.unwrap_or(ErrorCategory::Unknown))
        .with_exit_code(exit_code);
    err.problem_description = report.problem_description;
    err.solution_description = report.solution_description;
    err.advanced_problem_details = report.advanced_problem_details;
    err
}

async fn load_properties(
    work_dir: &WorkDir,
    config: &SpawnerConfig,
) -> Result<(Vec<SocketInfo>, Map<String, Value>), SpawnError> {
    let path = work_dir.layout().properties_json();
    let Some(raw) = crate::work_dir::WorkDirLayout::read_capped(&path, config.max_file_size).await?
    else {
        return Err(SpawnError::internal(
            "The application process signalled readiness without writing response/properties.json",
        ));
    };

    let document: PropertiesDocument = serde_json::from_str(&raw).map_err(|e| {
        SpawnError::internal("The application process wrote an invalid response/properties.json")
            .with_problem_description(e.to_string())
    })?;

    if document.sockets.is_empty() {
        return Err(SpawnError::internal(
            "The application process did not publish any sockets",
        ));
    }
    Ok((document.sockets, document.other))
}
