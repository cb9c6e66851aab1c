// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The work directory shared by a spawner and one starting worker.
//!
//! ```text
//! <work_dir>/
//!   args.json                  startup arguments
//!   args/<key>[.json]          one file per argument
//!   stdin                      FIFO, only for preloader-forked workers
//!   response/finish            FIFO; worker writes '1' (ready) or '0' (failed)
//!   response/properties.json   socket list and other properties
//!   response/error/            summary, category, problem_description.txt,
//!                              solution_description.txt, advanced_problem_details
//! ```

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use serde_json::Value;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

use crate::args::StartupArgs;
use crate::error::ErrorCategory;

/// Environment variable that tells a worker where its work directory is
pub const WORK_DIR_ENV: &str = "BERTH_SPAWN_WORK_DIR";

/// Paths inside a work directory. Does not own the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDirLayout {
    root: PathBuf,
}

impl WorkDirLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn args_json(&self) -> PathBuf {
        self.root.join("args.json")
    }

    pub fn args_dir(&self) -> PathBuf {
        self.root.join("args")
    }

    pub fn stdin_fifo(&self) -> PathBuf {
        self.root.join("stdin")
    }

    pub fn response_dir(&self) -> PathBuf {
        self.root.join("response")
    }

    pub fn finish_fifo(&self) -> PathBuf {
        self.response_dir().join("finish")
    }

    pub fn properties_json(&self) -> PathBuf {
        self.response_dir().join("properties.json")
    }

    pub fn error_dir(&self) -> PathBuf {
        self.response_dir().join("error")
    }

    /// Read a file up to `max` bytes; `Ok(None)` if it does not exist.
    pub async fn read_capped(path: &Path, max: u64) -> io::Result<Option<String>> {
        let file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut buf = Vec::new();
        file.take(max).read_to_end(&mut buf).await?;
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    /// Collect whatever the worker wrote to `response/error/`.
    pub async fn read_error_report(&self, max: u64) -> io::Result<ErrorReport> {
        let dir = self.error_dir();
        let read = |name: &'static str| {
            let path = dir.join(name);
            async move {
                Ok::<_, io::Error>(
                    Self::read_capped(&path, max)
                        .await?
                        .map(|s| s.trim_end().to_string())
                        .filter(|s| !s.is_empty()),
                )
            }
        };

        Ok(ErrorReport {
            summary: read("summary").await?,
            category: read("category").await?.map(|c| ErrorCategory::parse(&c)),
            problem_description: read("problem_description.txt").await?,
            solution_description: read("solution_description.txt").await?,
            advanced_problem_details: read("advanced_problem_details").await?,
        })
    }

    /// Write an error report into `response/error/` (worker side).
    pub fn write_error_report(&self, report: &ErrorReport) -> io::Result<()> {
        let dir = self.error_dir();
        fs::create_dir_all(&dir)?;
        let files: [(&str, Option<&str>); 5] = [
            ("summary", report.summary.as_deref()),
            ("category", report.category.as_ref().map(ErrorCategory::as_str)),
            ("problem_description.txt", report.problem_description.as_deref()),
            ("solution_description.txt", report.solution_description.as_deref()),
            ("advanced_problem_details", report.advanced_problem_details.as_deref()),
        ];
        for (name, contents) in files {
            if let Some(contents) = contents {
                fs::write(dir.join(name), contents)?;
            }
        }
        Ok(())
    }
}

/// What a worker wrote about its own startup failure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorReport {
    pub summary: Option<String>,
    pub category: Option<ErrorCategory>,
    pub problem_description: Option<String>,
    pub solution_description: Option<String>,
    pub advanced_problem_details: Option<String>,
}

impl ErrorReport {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: Some(summary.into()),
            ..Self::default()
        }
    }

    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
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
}

/// A work directory owned by the spawner.
///
/// The directory and everything in it is removed when this value is dropped,
/// whichever way the spawn attempt ends.
#[derive(Debug)]
pub struct WorkDir {
    dir: TempDir,
    layout: WorkDirLayout,
}

impl WorkDir {
    /// Create a fresh, private work directory under `base` with the response
    /// skeleton and the finish FIFO in place.
    pub fn create(base: &Path) -> io::Result<Self> {
        fs::create_dir_all(base)?;
        let dir = tempfile::Builder::new()
            .prefix("berth-spawn.")
            .tempdir_in(base)?;
        let layout = WorkDirLayout::new(dir.path());

        fs::create_dir(layout.response_dir())?;
        fs::create_dir(layout.error_dir())?;
        make_fifo(&layout.finish_fifo())?;

        Ok(Self { dir, layout })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn layout(&self) -> &WorkDirLayout {
        &self.layout
    }

    /// Add the `stdin` FIFO used by preloader-forked workers.
    pub fn create_stdin_fifo(&self) -> io::Result<PathBuf> {
        let path = self.layout.stdin_fifo();
        make_fifo(&path)?;
        Ok(path)
    }

    /// Write `args.json` and the per-key files under `args/`.
    pub fn write_args(&self, args: &StartupArgs) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(args).map_err(io::Error::other)?;
        create_new(&self.layout.args_json(), &json)?;

        let args_dir = self.layout.args_dir();
        fs::create_dir(&args_dir)?;
        for (key, value) in args.iter() {
            if !is_plain_file_name(key) {
                continue;
            }
            match value {
                Value::String(s) => create_new(&args_dir.join(key), s.as_bytes())?,
                Value::Number(_) | Value::Bool(_) => {
                    create_new(&args_dir.join(key), value.to_string().as_bytes())?
                }
                Value::Null => {}
                Value::Array(_) | Value::Object(_) => {
                    let json = serde_json::to_vec(value).map_err(io::Error::other)?;
                    create_new(&args_dir.join(format!("{key}.json")), &json)?
                }
            }
        }
        Ok(())
    }
}

fn make_fifo(path: &Path) -> io::Result<()> {
    mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(io::Error::from)
}

fn create_new(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

fn is_plain_file_name(key: &str) -> bool {
    !key.is_empty() && key != "." && key != ".." && !key.contains('/') && !key.contains('\0')
}
