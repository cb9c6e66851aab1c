// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker side of the work directory handshake.
//!
//! ```ignore
//! let handshake = WorkerHandshake::from_env()?;
//! let listener = bind(handshake.args())?;
//! handshake.advertise_sockets(&[socket_info])?;
//! handshake.advertise_readiness()?;
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use berth_protocol::SocketInfo;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::args::StartupArgs;
use crate::error::WorkerError;
use crate::work_dir::{ErrorReport, WORK_DIR_ENV, WorkDirLayout};

#[derive(Serialize)]
struct PropertiesDocument<'a> {
    sockets: &'a [SocketInfo],
    #[serde(flatten)]
    other: &'a Map<String, Value>,
}

/// A worker's view of its work directory.
#[derive(Debug, Clone)]
pub struct WorkerHandshake {
    layout: WorkDirLayout,
    args: StartupArgs,
}

impl WorkerHandshake {
    /// Open the work directory named by `BERTH_SPAWN_WORK_DIR`.
    pub fn from_env() -> Result<Self, WorkerError> {
        let dir = std::env::var_os(WORK_DIR_ENV).ok_or(WorkerError::MissingWorkDir(WORK_DIR_ENV))?;
        Self::open(Path::new(&dir))
    }

    /// Open a work directory and read its startup arguments.
    pub fn open(dir: &Path) -> Result<Self, WorkerError> {
        let layout = WorkDirLayout::new(dir);
        let raw = fs::read(layout.args_json())?;
        let args: StartupArgs = serde_json::from_slice(&raw)?;
        Ok(Self { layout, args })
    }

    pub fn args(&self) -> &StartupArgs {
        &self.args
    }

    pub fn work_dir(&self) -> &Path {
        self.layout.root()
    }

    /// Write `response/properties.json` with the given sockets.
    pub fn advertise_sockets(&self, sockets: &[SocketInfo]) -> Result<(), WorkerError> {
        self.advertise_properties(sockets, &Map::new())
    }

    /// Write `response/properties.json` with sockets and extra properties.
    pub fn advertise_properties(
        &self,
        sockets: &[SocketInfo],
        other: &Map<String, Value>,
    ) -> Result<(), WorkerError> {
        let document = PropertiesDocument { sockets, other };
        let json = serde_json::to_vec(&document)?;
        fs::write(self.layout.properties_json(), json)?;
        Ok(())
    }

    /// Tell the spawner that startup succeeded.
    pub fn advertise_readiness(&self) -> Result<(), WorkerError> {
        self.finish(b"1")
    }

    /// Describe a startup failure and tell the spawner about it.
    pub fn report_error(&self, report: &ErrorReport) -> Result<(), WorkerError> {
        self.layout.write_error_report(report)?;
        self.finish(b"0")
    }

    fn finish(&self, byte: &[u8]) -> Result<(), WorkerError> {
        let mut fifo = OpenOptions::new()
            .write(true)
            .open(self.layout.finish_fifo())?;
        fifo.write_all(byte)?;
        Ok(())
    }
}
