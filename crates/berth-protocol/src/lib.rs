// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Berth Protocol - framing and addressing shared by the spawner and workers
//!
//! This crate provides the byte-level contracts between a supervisor and the
//! application processes it starts:
//! - The framing channel (field messages and size-prefixed scalars)
//! - Descriptor passing over Unix domain sockets
//! - The session request header block
//! - Socket addresses and the socket list a worker advertises
//! - The line-oriented preloader control protocol
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      berth-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Session: NUL-separated header pairs inside one scalar      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Channel: u16 field messages | u32 scalars | SCM_RIGHTS     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: any AsyncRead/AsyncWrite (TCP, Unix, pipes)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use berth_protocol::{Channel, session};
//!
//! let mut channel = Channel::new(stream);
//! channel.write_message(&["hello", "world"]).await?;
//! let reply = channel.read_message().await?;
//!
//! let block = session::encode_headers([("REQUEST_METHOD", "PING")]);
//! channel.write_scalar(&block).await?;
//! ```

pub mod address;
pub mod channel;
pub mod control;
pub mod fd;
pub mod session;
pub mod sockets;

pub use address::{AddressError, ServerAddress};
pub use channel::{Channel, ChannelError};
pub use control::{ControlError, ControlRequest, ControlResponse};
pub use session::Headers;
pub use sockets::{SocketInfo, SocketProtocol};
