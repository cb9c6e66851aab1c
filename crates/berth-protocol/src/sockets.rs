// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sockets a worker advertises in its properties document.

use serde::{Deserialize, Serialize};

use crate::address::ServerAddress;

/// Protocol spoken on an advertised socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketProtocol {
    /// Size-prefixed session header block
    Session,
    /// Plain HTTP/1.x request head
    Http,
    /// Preloader control socket (newline-delimited JSON)
    Preloader,
}

impl SocketProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketProtocol::Session => "session",
            SocketProtocol::Http => "http",
            SocketProtocol::Preloader => "preloader",
        }
    }
}

impl std::fmt::Display for SocketProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_concurrency() -> i32 {
    1
}

/// One entry of the worker's socket list.
///
/// `concurrency` is the number of requests the socket serves at once;
/// `0` means unlimited and `-1` unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketInfo {
    pub name: String,
    pub address: ServerAddress,
    pub protocol: SocketProtocol,
    #[serde(default = "default_concurrency")]
    pub concurrency: i32,
    #[serde(default)]
    pub accept_http_requests: bool,
}

impl SocketInfo {
    pub fn new(name: impl Into<String>, address: ServerAddress, protocol: SocketProtocol) -> Self {
        Self {
            name: name.into(),
            address,
            protocol,
            concurrency: default_concurrency(),
            accept_http_requests: false,
        }
    }

    pub fn with_concurrency(mut self, concurrency: i32) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn accepting_http_requests(mut self) -> Self {
        self.accept_http_requests = true;
        self
    }
}
