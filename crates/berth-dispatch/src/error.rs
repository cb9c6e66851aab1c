// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for berth-dispatch.

use std::io;

use thiserror::Error;

use crate::connection::Connection;

/// Errors raised while serving requests.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// Socket I/O with a client failed. Never stops the loop.
    #[error("Client socket error: {0}")]
    Connection(#[source] io::Error),

    /// The listening socket failed.
    #[error("Failed to accept a connection: {0}")]
    Accept(#[source] io::Error),

    /// The request processor failed.
    #[error("Application error: {0:#}")]
    Application(anyhow::Error),

    /// The dispatch thread or its runtime could not be started.
    #[error("Failed to start dispatch thread: {0}")]
    Runtime(#[source] io::Error),

    /// The dispatch thread panicked.
    #[error("Dispatch thread panicked")]
    Panicked,
}

impl DispatchError {
    /// Wrap an application error.
    pub fn application(err: impl Into<anyhow::Error>) -> Self {
        DispatchError::Application(err.into())
    }

    /// Reclassify an application error as a client socket error when it is
    /// an I/O error the client connection itself raised.
    pub(crate) fn attribute_to(self, connection: &Connection) -> Self {
        let DispatchError::Application(err) = self else {
            return self;
        };
        match err.downcast::<io::Error>() {
            Ok(e) if connection.is_source_of(&e) => DispatchError::Connection(e),
            Ok(e) => DispatchError::Application(e.into()),
            Err(err) => DispatchError::Application(err),
        }
    }

    /// True for errors that only mean the client went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            DispatchError::Connection(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

/// I/O errors from request processors are application errors unless the
/// client connection raised them; see [`Connection::is_source_of`].
impl From<io::Error> for DispatchError {
    fn from(err: io::Error) -> Self {
        DispatchError::Application(err.into())
    }
}
