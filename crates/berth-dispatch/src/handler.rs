// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Extension points of the dispatch loop.

use async_trait::async_trait;
use berth_protocol::Headers;

use crate::error::DispatchError;
use crate::request::Request;

/// Produces the response for a request.
///
/// The processor writes to `request.connection()` and may call
/// [`Request::keepalive`] or [`Request::hijack`]. An `std::io::Error`
/// returned via `?` counts as a client error only when the request's
/// connection raised it; any other error is an application error.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn process_request(&self, request: &mut Request) -> Result<(), DispatchError>;
}

/// Lifecycle callbacks. All default to no-ops.
pub trait LifecycleHooks: Send + Sync {
    /// Called once on the dispatch thread before the first accept
    fn on_thread_start(&self) {}

    fn on_prepare_request(&self, _headers: &Headers) {}

    /// Called after the request was processed, whether it failed or not
    fn on_finalize_request(&self, _headers: &Headers, _had_error: bool) {}

    /// Called for an `OOBW` request before it is acknowledged
    fn on_out_of_band_work(&self) {}
}

/// Hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl LifecycleHooks for NoHooks {}
