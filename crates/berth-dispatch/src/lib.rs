// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Berth Dispatch - serving requests inside a worker process
//!
//! A worker binds one listening socket and runs one or more
//! [`DispatchLoop`]s over it, each on its own thread:
//!
//! ```text
//!            ┌───────────────┐
//!  client ──▶│ listen socket │◀── try_clone ──┐
//!            └───────┬───────┘                │
//!                    │ accept                 │
//!         ┌──────────▼──────────┐  ┌──────────┴──────────┐
//!         │ DispatchLoop (t#1)  │  │ DispatchLoop (t#2)  │
//!         │ parse → process →   │  │        ...          │
//!         │ finalize → keepalive│  │                     │
//!         └─────────────────────┘  └─────────────────────┘
//! ```
//!
//! `PING` and `OOBW` requests are answered by the loop itself; everything
//! else goes to a [`RequestHandler`].
//!
//! # Usage
//!
//! ```ignore
//! let listener = Listener::bind(&ServerAddress::tcp("127.0.0.1", 0))?;
//! let config = DispatchConfig::new().with_keepalive(true);
//! let thread = DispatchLoop::new(listener, config, Arc::new(MyHandler)).spawn()?;
//! // ...
//! thread.interrupt();
//! thread.join()?;
//! ```

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod interruption;
pub mod parser;
pub mod request;

pub use config::{ConfigError, DispatchConfig, Protocol};
pub use connection::{Connection, Listener};
pub use dispatch::{DispatchLoop, DispatchThread};
pub use error::DispatchError;
pub use handler::{LifecycleHooks, NoHooks, RequestHandler};
pub use interruption::{InterruptHandle, Interruption, LoopStatus};
pub use parser::{HttpParser, RequestParser, SessionParser};
pub use request::Request;
