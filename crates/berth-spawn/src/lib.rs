// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Berth Spawn - starting application processes
//!
//! A spawner and a starting worker talk through a private work directory:
//! the spawner writes the startup arguments, the worker answers with a
//! properties document (its sockets) and a single byte on the finish FIFO.
//!
//! Two ways to start a worker:
//! - [`Loader`]: run a loader command as a direct child.
//! - [`Preloader`]: ask a preloader (itself started by a loader) to fork one.
//!
//! The worker side of the handshake lives in [`worker`] and, for
//! preloaders, in [`fork_server`].
//!
//! # Usage
//!
//! ```ignore
//! use berth_spawn::{Loader, SpawnerConfig, StartupArgs};
//!
//! let loader = Loader::new(vec!["berth-worker".into()], SpawnerConfig::from_env()?)?;
//! let process = loader
//!     .spawn_with_timeout(&StartupArgs::new().set("app_root", "/srv/app"), Duration::from_secs(30))
//!     .await?;
//! for socket in process.sockets() {
//!     println!("{} listens on {}", socket.name, socket.address);
//! }
//! ```

pub mod args;
pub mod config;
pub mod error;
pub mod fork_server;
mod handshake;
pub mod loader;
pub mod preloader;
pub mod process;
pub mod work_dir;
pub mod worker;

pub use args::StartupArgs;
pub use config::{ConfigError, SpawnerConfig};
pub use error::{ErrorCategory, SpawnError, SpawnErrorKind, WorkerError};
pub use loader::Loader;
pub use preloader::Preloader;
pub use process::{AppProcess, InputHandle};
pub use work_dir::{ErrorReport, WORK_DIR_ENV, WorkDir, WorkDirLayout};
pub use worker::WorkerHandshake;
