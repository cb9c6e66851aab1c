// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handles to started application processes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use berth_protocol::{SocketInfo, SocketProtocol};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStderr, ChildStdin};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How often a process that is not our child is checked for existence
pub const FOREIGN_POLL_INTERVAL: Duration = Duration::from_millis(100);

const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Write end of a worker's stdin.
///
/// Closing it (or dropping it) is the worker's cue to shut down.
#[derive(Debug)]
pub enum InputHandle {
    /// Pipe to a direct child
    Pipe(ChildStdin),
    /// The work directory's `stdin` FIFO of a preloader-forked worker
    Fifo(pipe::Sender),
}

impl InputHandle {
    pub fn writer(&mut self) -> &mut (dyn AsyncWrite + Unpin + Send) {
        match self {
            InputHandle::Pipe(stdin) => stdin,
            InputHandle::Fifo(sender) => sender,
        }
    }
}

/// Watches a process for exit.
#[derive(Debug)]
pub(crate) enum ProcessWatch {
    /// Our own child; exit is observed with `waitpid`
    Child(Child),
    /// Forked by someone else; exit is observed by polling for existence
    Foreign { pid: Pid, exited: bool },
}

impl ProcessWatch {
    pub(crate) fn foreign(pid: i32) -> Self {
        ProcessWatch::Foreign {
            pid: Pid::from_raw(pid),
            exited: false,
        }
    }

    /// Wait for the process to exit.
    ///
    /// Returns the exit code when it is known. Cancel safe.
    pub(crate) async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        match self {
            ProcessWatch::Child(child) => Ok(child.wait().await?.code()),
            ProcessWatch::Foreign { pid, exited } => {
                while !*exited {
                    match kill(*pid, None::<Signal>) {
                        Ok(()) | Err(Errno::EPERM) => tokio::time::sleep(FOREIGN_POLL_INTERVAL).await,
                        Err(Errno::ESRCH) => *exited = true,
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(None)
            }
        }
    }

    pub(crate) fn try_exited(&mut self) -> bool {
        match self {
            ProcessWatch::Child(child) => !matches!(child.try_wait(), Ok(None)),
            ProcessWatch::Foreign { pid, exited } => {
                if !*exited && kill(*pid, None::<Signal>) == Err(Errno::ESRCH) {
                    *exited = true;
                }
                *exited
            }
        }
    }

    pub(crate) fn kill(&mut self) -> std::io::Result<()> {
        match self {
            ProcessWatch::Child(child) => match child.start_kill() {
                Ok(()) => Ok(()),
                // Already reaped
                Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
                Err(e) => Err(e),
            },
            ProcessWatch::Foreign { pid, exited } => {
                if *exited {
                    return Ok(());
                }
                match kill(*pid, Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}

impl Drop for ProcessWatch {
    fn drop(&mut self) {
        // Children are covered by kill_on_drop.
        if let ProcessWatch::Foreign { pid, exited: false } = self {
            let _ = kill(*pid, Signal::SIGKILL);
        }
    }
}

/// Drains a child's stderr in the background.
///
/// The first `limit` bytes are kept for error reports. Once the spawn has
/// succeeded the capture is detached and further lines are only logged.
#[derive(Debug)]
pub(crate) struct OutputCapture {
    buffer: Arc<Mutex<Option<String>>>,
    reader: Option<JoinHandle<()>>,
}

impl OutputCapture {
    pub(crate) fn start(stderr: Option<ChildStderr>, pid: i32, limit: usize) -> Self {
        let buffer = Arc::new(Mutex::new(Some(String::new())));
        let Some(stderr) = stderr else {
            return Self {
                buffer,
                reader: None,
            };
        };

        let shared = buffer.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let mut guard = shared.lock().unwrap_or_else(|e| e.into_inner());
                        match guard.as_mut() {
                            Some(captured) => {
                                debug!(pid, line = %line, "Worker output");
                                if captured.len() < limit {
                                    let room = limit - captured.len();
                                    let end = floor_char_boundary(&line, room);
                                    captured.push_str(&line[..end]);
                                    if captured.len() < limit {
                                        captured.push('\n');
                                    }
                                }
                            }
                            None => info!(pid, "{}", line),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(pid, error = %e, "Stopped reading worker output");
                        break;
                    }
                }
            }
        });

        Self {
            buffer,
            reader: Some(reader),
        }
    }

    /// What has been captured so far
    pub(crate) fn snapshot(&self) -> Option<String> {
        let guard = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        guard.clone().filter(|s| !s.is_empty())
    }

    /// Wait briefly for the reader to hit end-of-file, then return the capture.
    ///
    /// Only call this once the process is gone or being killed.
    pub(crate) async fn collect(&mut self) -> Option<String> {
        if let Some(reader) = self.reader.take() {
            let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await;
        }
        self.snapshot()
    }

    pub(crate) fn detach(&self) {
        let mut guard = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// A started application process that completed its handshake.
///
/// Dropping the handle closes the worker's stdin and kills the worker if it
/// is still running. Use [`AppProcess::shutdown`] for an orderly stop.
#[derive(Debug)]
pub struct AppProcess {
    pid: i32,
    input: Option<InputHandle>,
    sockets: Vec<SocketInfo>,
    properties: Map<String, Value>,
    started_at: DateTime<Utc>,
    watch: ProcessWatch,
}

impl AppProcess {
    pub(crate) fn new(
        pid: i32,
        input: Option<InputHandle>,
        sockets: Vec<SocketInfo>,
        properties: Map<String, Value>,
        watch: ProcessWatch,
    ) -> Self {
        Self {
            pid,
            input,
            sockets,
            properties,
            started_at: Utc::now(),
            watch,
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Sockets published by the worker, in publication order
    pub fn sockets(&self) -> &[SocketInfo] {
        &self.sockets
    }

    pub fn socket(&self, name: &str) -> Option<&SocketInfo> {
        self.sockets.iter().find(|s| s.name == name)
    }

    pub fn socket_by_protocol(&self, protocol: SocketProtocol) -> Option<&SocketInfo> {
        self.sockets.iter().find(|s| s.protocol == protocol)
    }

    /// Properties other than `sockets` from the properties document
    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn input(&mut self) -> Option<&mut InputHandle> {
        self.input.as_mut()
    }

    /// Close the worker's stdin.
    pub fn close_input(&mut self) {
        if self.input.take().is_some() {
            debug!(pid = self.pid, "Closed worker input");
        }
    }

    pub fn has_exited(&mut self) -> bool {
        self.watch.try_exited()
    }

    /// Wait for the worker to exit, returning its exit code when known.
    pub async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        self.watch.wait().await
    }

    pub fn kill(&mut self) -> std::io::Result<()> {
        self.watch.kill()
    }

    /// Close stdin, give the worker `grace` to exit on its own, then kill it.
    pub async fn shutdown(mut self, grace: Duration) -> std::io::Result<Option<i32>> {
        self.close_input();
        match tokio::time::timeout(grace, self.watch.wait()).await {
            Ok(result) => {
                info!(pid = self.pid, "Worker exited");
                result
            }
            Err(_) => {
                warn!(pid = self.pid, grace_ms = grace.as_millis() as u64, "Worker did not exit in time, killing");
                self.watch.kill()?;
                self.watch.wait().await
            }
        }
    }
}
