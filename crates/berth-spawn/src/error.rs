// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for berth-spawn.

use std::fmt;

use thiserror::Error;

/// How a spawn attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnErrorKind {
    /// The worker reported a startup failure through its error directory
    Error,
    /// The worker exited before signalling completion
    PrematureExit,
    /// The caller's timeout expired before the handshake finished
    Timeout,
    /// The spawner itself failed, or the worker broke the handshake contract
    Internal,
}

impl fmt::Display for SpawnErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SpawnErrorKind::Error => "startup error",
            SpawnErrorKind::PrematureExit => "premature exit",
            SpawnErrorKind::Timeout => "timeout",
            SpawnErrorKind::Internal => "internal error",
        })
    }
}

/// Category of a startup failure, as written to `response/error/category`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorCategory {
    Internal,
    FileSystem,
    OperatingSystem,
    Io,
    Timeout,
    #[default]
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Internal => "INTERNAL_ERROR",
            ErrorCategory::FileSystem => "FILE_SYSTEM_ERROR",
            ErrorCategory::OperatingSystem => "OPERATING_SYSTEM_ERROR",
            ErrorCategory::Io => "IO_ERROR",
            ErrorCategory::Timeout => "TIMEOUT_ERROR",
            ErrorCategory::Unknown => "UNKNOWN_ERROR",
        }
    }

    /// Parse a category name; anything unrecognised is `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "INTERNAL_ERROR" => ErrorCategory::Internal,
            "FILE_SYSTEM_ERROR" => ErrorCategory::FileSystem,
            "OPERATING_SYSTEM_ERROR" => ErrorCategory::OperatingSystem,
            "IO_ERROR" => ErrorCategory::Io,
            "TIMEOUT_ERROR" => ErrorCategory::Timeout,
            _ => ErrorCategory::Unknown,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed spawn attempt with everything known about why.
#[derive(Debug, Error)]
#[error("{kind}: {summary}")]
pub struct SpawnError {
    pub kind: SpawnErrorKind,
    pub category: ErrorCategory,
    pub summary: String,
    pub problem_description: Option<String>,
    pub solution_description: Option<String>,
    /// Typically a backtrace
    pub advanced_problem_details: Option<String>,
    /// Captured stderr of the worker, if any
    pub output: Option<String>,
    pub exit_code: Option<i32>,
    pub pid: Option<i32>,
}

impl SpawnError {
    pub fn new(kind: SpawnErrorKind, summary: impl Into<String>) -> Self {
        Self {
            kind,
            category: ErrorCategory::Unknown,
            summary: summary.into(),
            problem_description: None,
            solution_description: None,
            advanced_problem_details: None,
            output: None,
            exit_code: None,
            pid: None,
        }
    }

    pub fn internal(summary: impl Into<String>) -> Self {
        Self::new(SpawnErrorKind::Internal, summary).with_category(ErrorCategory::Internal)
    }

    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_problem_description(mut self, text: impl Into<String>) -> Self {
        self.problem_description = Some(text.into());
        self
    }

    pub fn with_solution_description(mut self, text: impl Into<String>) -> Self {
        self.solution_description = Some(text.into());
        self
    }

    pub fn with_advanced_problem_details(mut self, text: impl Into<String>) -> Self {
        self.advanced_problem_details = Some(text.into());
        self
    }

    pub fn with_output(mut self, output: Option<String>) -> Self {
        self.output = output.filter(|o| !o.is_empty());
        self
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = Some(pid);
        self
    }
}

impl From<std::io::Error> for SpawnError {
    fn from(e: std::io::Error) -> Self {
        SpawnError::new(SpawnErrorKind::Internal, e.to_string()).with_category(ErrorCategory::Io)
    }
}

impl From<serde_json::Error> for SpawnError {
    fn from(e: serde_json::Error) -> Self {
        SpawnError::internal(format!("JSON error: {e}"))
    }
}

/// Errors raised on the worker side of the handshake.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// The process was not started by a spawner.
    #[error("Missing required environment variable: {0}")]
    MissingWorkDir(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Control protocol error: {0}")]
    Control(#[from] berth_protocol::ControlError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_names() {
        for category in [
            ErrorCategory::Internal,
            ErrorCategory::FileSystem,
            ErrorCategory::OperatingSystem,
            ErrorCategory::Io,
            ErrorCategory::Timeout,
            ErrorCategory::Unknown,
        ] {
            assert_eq!(ErrorCategory::parse(category.as_str()), category);
        }
        assert_eq!(ErrorCategory::parse("OTHER"), ErrorCategory::Unknown);
        assert_eq!(ErrorCategory::parse(" IO_ERROR\n"), ErrorCategory::Io);
    }

    #[test]
    fn test_spawn_error_display() {
        let err = SpawnError::new(SpawnErrorKind::PrematureExit, "worker exited with code 3");
        assert_eq!(err.to_string(), "premature exit: worker exited with code 3");
    }

    #[test]
    fn test_empty_output_is_dropped() {
        let err = SpawnError::internal("x").with_output(Some(String::new()));
        assert!(err.output.is_none());
        assert_eq!(err.category, ErrorCategory::Internal);
    }

    #[test]
    fn test_io_error_conversion() {
        let err: SpawnError = std::io::Error::other("disk on fire").into();
        assert_eq!(err.kind, SpawnErrorKind::Internal);
        assert_eq!(err.category, ErrorCategory::Io);
        assert!(err.summary.contains("disk on fire"));
    }
}
