// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for a dispatch loop.

use std::str::FromStr;

use berth_protocol::SocketProtocol;
use berth_spawn::StartupArgs;
use berth_spawn::args::{CONNECT_PASSWORD, KEEPALIVE, PROTOCOL};

/// Largest request head accepted (128 KB)
pub const DEFAULT_MAX_HEADER_SIZE: usize = 128 * 1024;

/// Request protocol a dispatch loop speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Session,
    Http,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Session => "session",
            Protocol::Http => "http",
        }
    }

    /// The protocol to advertise for a socket served with this protocol
    pub fn socket_protocol(&self) -> SocketProtocol {
        match self {
            Protocol::Session => SocketProtocol::Session,
            Protocol::Http => SocketProtocol::Http,
        }
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(Protocol::Session),
            "http" => Ok(Protocol::Http),
            other => Err(ConfigError::InvalidValue(PROTOCOL, other.to_string())),
        }
    }
}

/// Dispatch loop configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Name of the socket this loop serves, used in logs and thread names
    pub socket_name: String,
    /// Default: session
    pub protocol: Protocol,
    /// When set, requests must carry this secret. Default: none
    pub connect_password: Option<String>,
    /// Allow connections to carry several requests. Default: false
    pub keepalive_enabled: bool,
    /// Largest request head accepted. Default: 128 KB
    pub max_header_size: usize,
    /// Stop the loop when the processor fails. Default: true
    pub abort_on_application_error: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            socket_name: "main".to_string(),
            protocol: Protocol::Session,
            connect_password: None,
            keepalive_enabled: false,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            abort_on_application_error: true,
        }
    }
}

impl DispatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from a worker's startup arguments.
    ///
    /// Reads `protocol`, `connect_password` and `keepalive`.
    pub fn from_args(args: &StartupArgs) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(protocol) = args.get_str(PROTOCOL) {
            config.protocol = protocol.parse()?;
        }
        config.connect_password = args
            .get_str(CONNECT_PASSWORD)
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        if args.get(KEEPALIVE).is_some() {
            config.keepalive_enabled = args.get_bool(KEEPALIVE).ok_or_else(|| {
                ConfigError::InvalidValue(KEEPALIVE, format!("{:?}", args.get(KEEPALIVE)))
            })?;
        }
        Ok(config)
    }

    pub fn with_socket_name(mut self, name: impl Into<String>) -> Self {
        self.socket_name = name.into();
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_connect_password(mut self, password: impl Into<String>) -> Self {
        self.connect_password = Some(password.into());
        self
    }

    pub fn with_keepalive(mut self, enabled: bool) -> Self {
        self.keepalive_enabled = enabled;
        self
    }

    pub fn with_max_header_size(mut self, size: usize) -> Self {
        self.max_header_size = size;
        self
    }

    pub fn with_abort_on_application_error(mut self, abort: bool) -> Self {
        self.abort_on_application_error = abort;
        self
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A setting holds a value that cannot be used.
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DispatchConfig::default();
        assert_eq!(config.protocol, Protocol::Session);
        assert!(config.connect_password.is_none());
        assert!(!config.keepalive_enabled);
        assert_eq!(config.max_header_size, 128 * 1024);
        assert!(config.abort_on_application_error);
    }

    #[test]
    fn test_from_args() {
        let args = StartupArgs::new()
            .set(PROTOCOL, "http")
            .set(CONNECT_PASSWORD, "s3cret")
            .set(KEEPALIVE, true);
        let config = DispatchConfig::from_args(&args).unwrap();
        assert_eq!(config.protocol, Protocol::Http);
        assert_eq!(config.connect_password.as_deref(), Some("s3cret"));
        assert!(config.keepalive_enabled);
    }

    #[test]
    fn test_from_args_empty_password_means_none() {
        let args = StartupArgs::new().set(CONNECT_PASSWORD, "");
        assert!(DispatchConfig::from_args(&args).unwrap().connect_password.is_none());
    }

    #[test]
    fn test_from_args_rejects_bad_values() {
        let args = StartupArgs::new().set(PROTOCOL, "gopher");
        assert!(DispatchConfig::from_args(&args).is_err());

        let args = StartupArgs::new().set(KEEPALIVE, "sometimes");
        assert!(DispatchConfig::from_args(&args).is_err());
    }

    #[test]
    fn test_builder() {
        let config = DispatchConfig::new()
            .with_socket_name("http")
            .with_protocol(Protocol::Http)
            .with_keepalive(true)
            .with_max_header_size(1024)
            .with_abort_on_application_error(false);
        assert_eq!(config.socket_name, "http");
        assert_eq!(config.protocol.socket_protocol(), SocketProtocol::Http);
        assert!(config.keepalive_enabled);
        assert_eq!(config.max_header_size, 1024);
        assert!(!config.abort_on_application_error);
    }
}
