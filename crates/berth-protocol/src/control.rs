// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Preloader control protocol.
//!
//! One request per connection, each a single line of JSON:
//!
//! ```text
//! -> {"command":"spawn","work_dir":"/tmp/berth-spawn.XXXX"}
//! <- {"result":"ok","pid":1234}
//! <- {"result":"error","message":"..."}
//! ```

use std::io::BufRead;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Longest response line a client accepts (10 KB)
pub const MAX_LINE_SIZE: usize = 10 * 1024;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ControlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("control line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("control line is not valid JSON: {0}")]
    Unparseable(#[source] serde_json::Error),

    #[error("control line has an unexpected structure: {0}")]
    InvalidStructure(#[source] serde_json::Error),

    #[error("failed to encode control line: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Fork a worker that performs its handshake in `work_dir`
    Spawn { work_dir: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok { pid: i32 },
    Error { message: String },
}

/// Serialize a control message as one newline-terminated line
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, ControlError> {
    let mut line = serde_json::to_vec(message).map_err(ControlError::Encode)?;
    line.push(b'\n');
    Ok(line)
}

/// Parse a line, telling apart broken JSON from well-formed JSON of the wrong shape
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, ControlError> {
    let value: serde_json::Value =
        serde_json::from_str(line.trim_end()).map_err(ControlError::Unparseable)?;
    serde_json::from_value(value).map_err(ControlError::InvalidStructure)
}

fn finish_line(mut raw: Vec<u8>, max: usize) -> Result<Option<String>, ControlError> {
    if raw.is_empty() {
        return Ok(None);
    }
    if raw.last() == Some(&b'\n') {
        raw.pop();
    } else if raw.len() > max {
        return Err(ControlError::LineTooLong(max));
    }
    String::from_utf8(raw)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e).into())
}

/// Read one line of at most `max` bytes, excluding the newline.
///
/// Returns `Ok(None)` on end-of-stream before any byte.
pub async fn read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max: usize,
) -> Result<Option<String>, ControlError> {
    let mut raw = Vec::new();
    reader
        .take(max as u64 + 1)
        .read_until(b'\n', &mut raw)
        .await?;
    finish_line(raw, max)
}

/// Blocking counterpart of [`read_line`] for the fork server
pub fn read_line_blocking<R: BufRead>(
    reader: &mut R,
    max: usize,
) -> Result<Option<String>, ControlError> {
    use std::io::Read;

    let mut raw = Vec::new();
    reader.take(max as u64 + 1).read_until(b'\n', &mut raw)?;
    finish_line(raw, max)
}
