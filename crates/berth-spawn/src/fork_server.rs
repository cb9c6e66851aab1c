// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The preloader's fork loop.
//!
//! Runs inside a preloader process after the application has been loaded.
//! Each control connection carries one spawn command; the server forks, and
//! the child returns from [`serve`] with the work directory it should
//! perform its handshake in. The parent answers with the child's PID and
//! keeps serving until its own stdin is closed.
//!
//! Everything here is blocking. [`serve`] must be called while the process
//! is still single-threaded, before any async runtime has been built.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;

use berth_protocol::control::{self, ControlRequest, ControlResponse, MAX_LINE_SIZE};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::unistd::{ForkResult, dup2, fork};
use tracing::{debug, info, warn};

use crate::error::WorkerError;
use crate::work_dir::{WORK_DIR_ENV, WorkDirLayout};

/// How [`serve`] returned
#[derive(Debug, PartialEq, Eq)]
pub enum ServeOutcome {
    /// Stdin was closed; the preloader should exit
    Shutdown,
    /// We are a freshly forked worker and must handshake in `work_dir`
    Forked { work_dir: PathBuf },
}

enum Handled {
    Parent,
    Child(PathBuf),
}

/// Serve spawn commands on `listener` until stdin reaches end-of-file.
pub fn serve(listener: UnixListener) -> Result<ServeOutcome, WorkerError> {
    // Forked workers are reaped by the kernel; the spawner watches them by PID.
    // SAFETY: installing SIG_IGN does not run any handler code.
    unsafe { signal(Signal::SIGCHLD, SigHandler::SigIgn) }.map_err(io::Error::from)?;

    let stdin = io::stdin();
    let mut buf = [0u8; 256];
    loop {
        let (stdin_ready, listener_ready) = {
            let mut fds = [
                PollFd::new(stdin.as_fd(), PollFlags::POLLIN),
                PollFd::new(listener.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e).into()),
            }
            let ready = |fd: &PollFd| fd.revents().is_some_and(|r| !r.is_empty());
            (ready(&fds[0]), ready(&fds[1]))
        };

        if stdin_ready {
            let n = stdin.lock().read(&mut buf)?;
            if n == 0 {
                info!("Preloader input closed, shutting down");
                return Ok(ServeOutcome::Shutdown);
            }
        }

        if listener_ready {
            let (stream, _) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Preloader failed to accept a control connection");
                    continue;
                }
            };
            match handle_connection(stream) {
                Ok(Handled::Parent) => {}
                Ok(Handled::Child(work_dir)) => {
                    drop(listener);
                    become_worker(&work_dir)?;
                    return Ok(ServeOutcome::Forked { work_dir });
                }
                Err(e) => warn!(error = %e, "Preloader control connection failed"),
            }
        }
    }
}

fn handle_connection(stream: UnixStream) -> Result<Handled, WorkerError> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;

    let Some(line) = control::read_line_blocking(&mut reader, MAX_LINE_SIZE)? else {
        return Ok(Handled::Parent);
    };
    let work_dir = match control::decode_line::<ControlRequest>(&line) {
        Ok(ControlRequest::Spawn { work_dir }) => work_dir,
        Err(e) => {
            respond(
                &mut writer,
                &ControlResponse::Error {
                    message: format!("Invalid command: {e}"),
                },
            )?;
            return Ok(Handled::Parent);
        }
    };

    // SAFETY: the preloader is single-threaded, so the child may run
    // arbitrary code after the fork.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            debug!(pid = child.as_raw(), work_dir = %work_dir.display(), "Forked worker");
            respond(&mut writer, &ControlResponse::Ok { pid: child.as_raw() })?;
            Ok(Handled::Parent)
        }
        Ok(ForkResult::Child) => Ok(Handled::Child(work_dir)),
        Err(e) => {
            respond(
                &mut writer,
                &ControlResponse::Error {
                    message: format!("Cannot fork: {e}"),
                },
            )?;
            Ok(Handled::Parent)
        }
    }
}

fn respond(writer: &mut UnixStream, response: &ControlResponse) -> Result<(), WorkerError> {
    writer.write_all(&control::encode_line(response)?)?;
    Ok(())
}

/// Set up a freshly forked child as a worker for `work_dir`.
fn become_worker(work_dir: &std::path::Path) -> Result<(), WorkerError> {
    // SAFETY: restoring the default disposition does not run any handler code.
    unsafe { signal(Signal::SIGCHLD, SigHandler::SigDfl) }.map_err(io::Error::from)?;

    let layout = WorkDirLayout::new(work_dir);
    let fifo = layout.stdin_fifo();
    if fifo.exists() {
        let input = File::open(&fifo)?;
        dup2(input.as_raw_fd(), io::stdin().as_raw_fd()).map_err(io::Error::from)?;
    }

    // SAFETY: the forked child is single-threaded.
    unsafe { std::env::set_var(WORK_DIR_ENV, work_dir) };
    Ok(())
}
