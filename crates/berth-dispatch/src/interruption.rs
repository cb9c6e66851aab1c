// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cooperative interruption of a dispatch loop.
//!
//! Another thread requests a stop through an [`InterruptHandle`]. The loop
//! only honours the request while it is interruptable: when idle, or at safe
//! points it checks itself. Inside a request the loop pushes a
//! non-interruptable override, so a stop requested mid-request takes effect
//! after the response has been finalized.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

/// Snapshot of a loop's progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStatus {
    /// Requests started so far
    pub iteration: u64,
    /// Whether an interrupt would currently take effect
    pub interruptable: bool,
    /// Whether the loop has stopped because of an interrupt
    pub interrupted: bool,
}

/// Thread-safe handle for interrupting a loop and observing its status.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    token: CancellationToken,
    status: Arc<Mutex<LoopStatus>>,
}

impl InterruptHandle {
    /// Request a stop. Idempotent.
    pub fn interrupt(&self) {
        self.token.cancel();
    }

    pub fn is_interrupt_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn status(&self) -> LoopStatus {
        *lock(&self.status)
    }
}

fn lock(status: &Mutex<LoopStatus>) -> MutexGuard<'_, LoopStatus> {
    status.lock().unwrap_or_else(|e| e.into_inner())
}

/// The loop-side half: override stack and safe-point checks.
#[derive(Debug)]
pub struct Interruption {
    token: CancellationToken,
    status: Arc<Mutex<LoopStatus>>,
    overrides: Vec<bool>,
}

impl Default for Interruption {
    fn default() -> Self {
        Self::new()
    }
}

impl Interruption {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            status: Arc::new(Mutex::new(LoopStatus {
                interruptable: true,
                ..LoopStatus::default()
            })),
            overrides: vec![true],
        }
    }

    pub fn handle(&self) -> InterruptHandle {
        InterruptHandle {
            token: self.token.clone(),
            status: self.status.clone(),
        }
    }

    pub fn is_interruptable(&self) -> bool {
        self.overrides.last().copied().unwrap_or(true)
    }

    /// Override interruptability until the matching [`Interruption::pop`].
    pub fn push(&mut self, interruptable: bool) {
        self.overrides.push(interruptable);
        self.publish();
    }

    /// Undo the latest [`Interruption::push`].
    ///
    /// # Panics
    ///
    /// Panics when there is no override left to pop.
    pub fn pop(&mut self) {
        assert!(
            self.overrides.len() > 1,
            "interruptability override stack popped more often than pushed"
        );
        self.overrides.pop();
        self.publish();
    }

    /// Safe-point check. True when a stop was requested and may take effect
    /// now; the loop is then marked interrupted.
    pub fn should_stop(&self) -> bool {
        if self.is_interruptable() && self.token.is_cancelled() {
            lock(&self.status).interrupted = true;
            return true;
        }
        false
    }

    /// Run `future`, abandoning it if a stop is requested while interruptable.
    ///
    /// Returns `None` when interrupted. `future` must be cancel safe.
    pub async fn interruptable<F: Future>(&self, future: F) -> Option<F::Output> {
        if !self.is_interruptable() {
            return Some(future.await);
        }
        tokio::select! {
            biased;

            _ = self.token.cancelled() => {
                lock(&self.status).interrupted = true;
                None
            }
            output = future => Some(output),
        }
    }

    /// Count a new request
    pub(crate) fn begin_iteration(&self) {
        lock(&self.status).iteration += 1;
    }

    fn publish(&self) {
        lock(&self.status).interruptable = self.is_interruptable();
    }
}
