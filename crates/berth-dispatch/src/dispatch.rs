// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The dispatch loop: accept, parse, process, finalize, repeat.
//!
//! Each loop owns one OS thread with a single-threaded Tokio runtime, so a
//! request is processed on the same thread from parse to finalize. Several
//! loops may share a listening socket; the kernel's accept queue decides
//! which one gets the next client.

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::config::{DispatchConfig, Protocol};
use crate::connection::{Connection, Listener};
use crate::error::DispatchError;
use crate::handler::{LifecycleHooks, NoHooks, RequestHandler};
use crate::interruption::{InterruptHandle, Interruption, LoopStatus};
use crate::parser::{RequestParser, parser_for};
use crate::request::{OOBW, PING, Request};

/// Everything a loop needs to serve one request.
struct Dispatcher {
    config: DispatchConfig,
    parser: Arc<dyn RequestParser>,
    handler: Arc<dyn RequestHandler>,
    hooks: Arc<dyn LifecycleHooks>,
}

/// A request-serving loop over one listening socket.
pub struct DispatchLoop {
    listener: Listener,
    dispatcher: Dispatcher,
    interruption: Interruption,
}

impl DispatchLoop {
    pub fn new(
        listener: Listener,
        config: DispatchConfig,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        let parser = parser_for(&config);
        Self {
            listener,
            dispatcher: Dispatcher {
                config,
                parser,
                handler,
                hooks: Arc::new(NoHooks),
            },
            interruption: Interruption::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.dispatcher.hooks = hooks;
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.dispatcher.config
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interruption.handle()
    }

    /// Run the loop on a dedicated thread.
    pub fn spawn(self) -> Result<DispatchThread, DispatchError> {
        let handle = self.interruption.handle();
        let name = format!("berth-dispatch-{}", self.dispatcher.config.socket_name);
        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(DispatchError::Runtime)?;
                runtime.block_on(self.run())
            })
            .map_err(DispatchError::Runtime)?;
        Ok(DispatchThread { thread, handle })
    }

    /// Serve until interrupted or a fatal error occurs.
    ///
    /// Must run inside a Tokio runtime. Returns `Ok(())` when interrupted.
    pub async fn run(self) -> Result<(), DispatchError> {
        let DispatchLoop {
            listener,
            dispatcher,
            mut interruption,
        } = self;
        let listener = listener.into_async().map_err(DispatchError::Accept)?;
        let socket = dispatcher.config.socket_name.clone();

        dispatcher.hooks.on_thread_start();
        info!(
            socket = %socket,
            protocol = dispatcher.config.protocol.as_str(),
            "Dispatch loop started"
        );

        let mut kept: Option<Connection> = None;
        loop {
            if interruption.should_stop() {
                break;
            }

            let connection = match kept.take() {
                Some(connection) => match interruption.interruptable(wait_for_next(connection)).await {
                    None => break,
                    Some(Ok(connection)) => connection,
                    Some(Err(e)) => {
                        debug!(socket = %socket, error = %e, "Kept-alive connection failed");
                        continue;
                    }
                },
                None => match interruption.interruptable(listener.accept()).await {
                    None => break,
                    Some(Ok(connection)) => connection,
                    Some(Err(e)) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                    Some(Err(e)) => {
                        error!(socket = %socket, error = %e, "Listening socket failed");
                        return Err(DispatchError::Accept(e));
                    }
                },
            };

            interruption.push(false);
            interruption.begin_iteration();
            let result = dispatcher.handle_connection(connection).await;
            interruption.pop();

            match result {
                Ok(next) => kept = next,
                Err(e) if e.is_disconnect() => {
                    debug!(socket = %socket, error = %e, "Client disconnected");
                }
                Err(e @ DispatchError::Connection(_)) => {
                    warn!(socket = %socket, error = %e, "Client socket error");
                }
                Err(e) if !dispatcher.config.abort_on_application_error => {
                    error!(socket = %socket, error = %e, "Request failed");
                }
                Err(e) => {
                    error!(socket = %socket, error = %e, "Request failed, stopping dispatch loop");
                    return Err(e);
                }
            }
        }

        info!(socket = %socket, "Dispatch loop interrupted");
        Ok(())
    }
}

async fn wait_for_next(connection: Connection) -> io::Result<Connection> {
    connection.readable().await?;
    Ok(connection)
}

impl Dispatcher {
    /// Serve one request. Returns the connection when it should be kept
    /// alive for the next one.
    async fn handle_connection(
        &self,
        mut connection: Connection,
    ) -> Result<Option<Connection>, DispatchError> {
        let headers = match self.parser.parse(&mut connection).await {
            Ok(Some(headers)) => headers,
            Ok(None) => {
                debug!("No request parsed, closing connection");
                connection.close().await;
                return Ok(None);
            }
            Err(e) => {
                connection.close().await;
                return Err(e);
            }
        };

        let mut request = Request::new(
            headers,
            connection,
            self.config.keepalive_enabled,
            self.config.protocol == Protocol::Http,
        );
        self.hooks.on_prepare_request(request.headers());

        let result = self.process(&mut request).await;
        self.hooks
            .on_finalize_request(request.headers(), result.is_err());

        let hijacked = request.is_hijacked();
        let (connection, keepalive) = request.finish();
        let result = match &connection {
            Some(connection) => result.map_err(|e| e.attribute_to(connection)),
            None => result,
        };
        match connection {
            Some(connection) if result.is_ok() && keepalive => Ok(Some(connection)),
            Some(connection) => {
                connection.close().await;
                result.map(|_| None)
            }
            None => {
                if hijacked {
                    debug!("Connection hijacked by request processor");
                }
                result.map(|_| None)
            }
        }
    }

    async fn process(&self, request: &mut Request) -> Result<(), DispatchError> {
        match request.method() {
            Some(PING) => reply(request, b"pong").await,
            Some(OOBW) => {
                self.hooks.on_out_of_band_work();
                reply(request, b"oobw done").await
            }
            _ => self.handler.process_request(request).await,
        }
    }
}

async fn reply(request: &mut Request, body: &[u8]) -> Result<(), DispatchError> {
    if let Some(connection) = request.connection() {
        connection
            .write_all(body)
            .await
            .map_err(DispatchError::Connection)?;
        connection.flush().await.map_err(DispatchError::Connection)?;
    }
    Ok(())
}

/// A dispatch loop running on its own thread.
#[derive(Debug)]
pub struct DispatchThread {
    thread: JoinHandle<Result<(), DispatchError>>,
    handle: InterruptHandle,
}

impl DispatchThread {
    /// Ask the loop to stop at its next safe point.
    pub fn interrupt(&self) {
        self.handle.interrupt();
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.handle.clone()
    }

    pub fn status(&self) -> LoopStatus {
        self.handle.status()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the loop to end and return how it ended.
    pub fn join(self) -> Result<(), DispatchError> {
        self.thread.join().map_err(|_| DispatchError::Panicked)?
    }
}
