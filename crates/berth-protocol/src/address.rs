// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server socket addresses.
//!
//! Addresses are written as `tcp://host:port` or `unix:/absolute/path`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("unsupported address scheme in {0:?} (expected tcp:// or unix:)")]
    UnsupportedScheme(String),

    #[error("invalid TCP address {0:?} (expected host:port)")]
    InvalidTcp(String),

    #[error("Unix socket path must be absolute: {0:?}")]
    RelativeUnixPath(String),
}

/// Where a worker socket listens
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ServerAddress {
    /// `host:port`
    Tcp(String),
    Unix(PathBuf),
}

impl ServerAddress {
    pub fn tcp(host: &str, port: u16) -> Self {
        if host.contains(':') {
            ServerAddress::Tcp(format!("[{host}]:{port}"))
        } else {
            ServerAddress::Tcp(format!("{host}:{port}"))
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        ServerAddress::Unix(path.into())
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, ServerAddress::Unix(_))
    }

    /// The socket path of a Unix address
    pub fn unix_path(&self) -> Option<&std::path::Path> {
        match self {
            ServerAddress::Unix(path) => Some(path),
            ServerAddress::Tcp(_) => None,
        }
    }
}

impl FromStr for ServerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("tcp://") {
            match rest.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                    Ok(ServerAddress::Tcp(rest.to_string()))
                }
                _ => Err(AddressError::InvalidTcp(s.to_string())),
            }
        } else if let Some(path) = s.strip_prefix("unix:") {
            if !path.starts_with('/') {
                return Err(AddressError::RelativeUnixPath(s.to_string()));
            }
            Ok(ServerAddress::Unix(PathBuf::from(path)))
        } else {
            Err(AddressError::UnsupportedScheme(s.to_string()))
        }
    }
}

impl TryFrom<String> for ServerAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServerAddress> for String {
    fn from(value: ServerAddress) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerAddress::Tcp(host_port) => write!(f, "tcp://{host_port}"),
            ServerAddress::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_address() {
        let address: ServerAddress = "tcp://127.0.0.1:3000".parse().unwrap();
        assert_eq!(address, ServerAddress::Tcp("127.0.0.1:3000".to_string()));
        assert_eq!(address.to_string(), "tcp://127.0.0.1:3000");
        assert!(!address.is_unix());
    }

    #[test]
    fn test_parse_unix_address() {
        let address: ServerAddress = "unix:/tmp/app.sock".parse().unwrap();
        assert_eq!(address.unix_path(), Some(std::path::Path::new("/tmp/app.sock")));
        assert_eq!(address.to_string(), "unix:/tmp/app.sock");
    }

    #[test]
    fn test_tcp_constructor_brackets_ipv6() {
        assert_eq!(ServerAddress::tcp("::1", 80).to_string(), "tcp://[::1]:80");
        assert_eq!(ServerAddress::tcp("localhost", 80).to_string(), "tcp://localhost:80");
    }

    #[test]
    fn test_parse_rejects_bad_addresses() {
        assert!(matches!(
            "http://x".parse::<ServerAddress>(),
            Err(AddressError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            "tcp://127.0.0.1".parse::<ServerAddress>(),
            Err(AddressError::InvalidTcp(_))
        ));
        assert!(matches!(
            "tcp://host:notaport".parse::<ServerAddress>(),
            Err(AddressError::InvalidTcp(_))
        ));
        assert!(matches!(
            "unix:relative.sock".parse::<ServerAddress>(),
            Err(AddressError::RelativeUnixPath(_))
        ));
    }

    #[test]
    fn test_address_serializes_as_string() {
        let json = serde_json::to_string(&ServerAddress::unix("/run/a.sock")).unwrap();
        assert_eq!(json, "\"unix:/run/a.sock\"");
        let back: ServerAddress = serde_json::from_str("\"tcp://[::1]:9\"").unwrap();
        assert_eq!(back, ServerAddress::Tcp("[::1]:9".to_string()));
    }
}
