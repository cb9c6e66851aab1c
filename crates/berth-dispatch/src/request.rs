// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-request context handed to the request processor.

use berth_protocol::Headers;
use tokio::io::{AsyncReadExt, Take};

use crate::connection::Connection;

pub const REQUEST_METHOD: &str = "REQUEST_METHOD";
pub const CONTENT_LENGTH: &str = "CONTENT_LENGTH";
pub const TRANSFER_ENCODING: &str = "HTTP_TRANSFER_ENCODING";

/// Methods the loop answers itself
pub const PING: &str = "PING";
pub const OOBW: &str = "OOBW";

/// One parsed request and the connection it arrived on.
#[derive(Debug)]
pub struct Request {
    headers: Headers,
    connection: Option<Connection>,
    can_keepalive: bool,
    keepalive_performed: bool,
    full_http_response: bool,
    hijacked: bool,
}

impl Request {
    pub(crate) fn new(
        headers: Headers,
        connection: Connection,
        keepalive_enabled: bool,
        full_http_response: bool,
    ) -> Self {
        let can_keepalive = keepalive_enabled
            && !headers.contains_key(TRANSFER_ENCODING)
            && !headers.contains_key(CONTENT_LENGTH);
        Self {
            headers,
            connection: Some(connection),
            can_keepalive,
            keepalive_performed: false,
            full_http_response,
            hijacked: false,
        }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn method(&self) -> Option<&str> {
        self.header(REQUEST_METHOD)
    }

    /// The client connection, unless it has been hijacked
    pub fn connection(&mut self) -> Option<&mut Connection> {
        self.connection.as_mut()
    }

    /// Whether the processor must write a status line and headers itself
    pub fn full_http_response(&self) -> bool {
        self.full_http_response
    }

    /// Whether this connection may stay open after the response
    pub fn can_keepalive(&self) -> bool {
        self.can_keepalive
    }

    /// Ask for the connection to be kept open after this request.
    ///
    /// Returns false, and does nothing, when the request is not eligible.
    pub fn keepalive(&mut self) -> bool {
        if self.can_keepalive {
            self.keepalive_performed = true;
        }
        self.can_keepalive
    }

    pub fn keepalive_performed(&self) -> bool {
        self.keepalive_performed
    }

    /// Take ownership of the connection. The loop will neither close nor
    /// reuse it.
    pub fn hijack(&mut self) -> Option<Connection> {
        self.hijacked = true;
        self.connection.take()
    }

    pub fn is_hijacked(&self) -> bool {
        self.hijacked
    }

    /// The request body as a reader.
    ///
    /// Without `CONTENT_LENGTH` or a transfer encoding the body is empty;
    /// with `CONTENT_LENGTH` it is limited to that many bytes; otherwise it
    /// runs until the client closes its side.
    pub fn body(&mut self) -> Option<Take<&mut Connection>> {
        let limit = match self.headers.get(CONTENT_LENGTH) {
            Some(length) => length.trim().parse::<u64>().unwrap_or(0),
            None if self.headers.contains_key(TRANSFER_ENCODING) => u64::MAX,
            None => 0,
        };
        self.connection.as_mut().map(|c| c.take(limit))
    }

    /// Hand back the connection, if the loop still owns it, and whether
    /// keep-alive was performed.
    pub(crate) fn finish(self) -> (Option<Connection>, bool) {
        (self.connection, self.keepalive_performed)
    }
}
