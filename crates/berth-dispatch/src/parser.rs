// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request head parsers, one per protocol.
//!
//! A parser reads exactly one request head from a connection. `Ok(None)`
//! means there is no usable request (end-of-stream, malformed or oversized
//! head, wrong secret) and the connection should be closed without a reply.

use std::sync::Arc;

use async_trait::async_trait;
use berth_protocol::session::{self, Headers};
use berth_protocol::{Channel, ChannelError};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::config::{DispatchConfig, Protocol};
use crate::connection::Connection;
use crate::error::DispatchError;

/// Header carrying the secret in session requests
pub const SESSION_PASSWORD_HEADER: &str = "BERTH_CONNECT_PASSWORD";

/// Header carrying the secret in HTTP requests
pub const HTTP_PASSWORD_HEADER: &str = "HTTP_X_BERTH_CONNECT_PASSWORD";

const HTTP_READ_CHUNK: usize = 16 * 1024;
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

#[async_trait]
pub trait RequestParser: Send + Sync {
    /// Read one request head. See the module docs for `Ok(None)`.
    async fn parse(&self, connection: &mut Connection) -> Result<Option<Headers>, DispatchError>;
}

/// Pick the parser for a configuration's protocol.
pub fn parser_for(config: &DispatchConfig) -> Arc<dyn RequestParser> {
    let password = config.connect_password.clone();
    match config.protocol {
        Protocol::Session => Arc::new(SessionParser::new(password, config.max_header_size)),
        Protocol::Http => Arc::new(HttpParser::new(password, config.max_header_size)),
    }
}

fn password_matches(expected: Option<&str>, given: Option<&String>) -> bool {
    match expected {
        None => true,
        Some(expected) => given.is_some_and(|g| g == expected),
    }
}

/// Parses size-prefixed session header blocks.
#[derive(Debug, Clone)]
pub struct SessionParser {
    connect_password: Option<String>,
    max_header_size: usize,
}

impl SessionParser {
    pub fn new(connect_password: Option<String>, max_header_size: usize) -> Self {
        Self {
            connect_password,
            max_header_size,
        }
    }
}

#[async_trait]
impl RequestParser for SessionParser {
    async fn parse(&self, connection: &mut Connection) -> Result<Option<Headers>, DispatchError> {
        let mut channel = Channel::new(connection);
        let block = match channel.read_scalar(self.max_header_size).await {
            Ok(Some(block)) => block,
            Ok(None) => return Ok(None),
            Err(ChannelError::Io(e)) => return Err(DispatchError::Connection(e)),
            Err(ChannelError::SizeExceeded { size, max }) => {
                warn!(size, max, "Session request header block exceeds maximum size");
                return Ok(None);
            }
            Err(e) => {
                debug!(error = %e, "Incomplete session request");
                return Ok(None);
            }
        };

        let headers = match session::decode_headers(&block) {
            Ok(headers) => headers,
            Err(e) => {
                warn!(error = %e, "Malformed session request header block");
                return Ok(None);
            }
        };

        if !password_matches(
            self.connect_password.as_deref(),
            headers.get(SESSION_PASSWORD_HEADER),
        ) {
            warn!("Client sent an invalid connect password");
            return Ok(None);
        }
        Ok(Some(headers))
    }
}

/// Parses plain HTTP/1.x request heads into CGI-style headers.
#[derive(Debug, Clone)]
pub struct HttpParser {
    connect_password: Option<String>,
    max_header_size: usize,
}

impl HttpParser {
    pub fn new(connect_password: Option<String>, max_header_size: usize) -> Self {
        Self {
            connect_password,
            max_header_size,
        }
    }
}

#[async_trait]
impl RequestParser for HttpParser {
    async fn parse(&self, connection: &mut Connection) -> Result<Option<Headers>, DispatchError> {
        let mut data = Vec::with_capacity(HTTP_READ_CHUNK);
        let mut chunk = vec![0u8; HTTP_READ_CHUNK];
        let head_len = loop {
            if let Some(pos) = find(&data, HEAD_TERMINATOR) {
                break pos;
            }
            if data.len() >= self.max_header_size {
                warn!(max = self.max_header_size, "HTTP request head exceeds maximum size");
                return Ok(None);
            }
            let n = connection
                .read(&mut chunk)
                .await
                .map_err(DispatchError::Connection)?;
            if n == 0 {
                return Ok(None);
            }
            data.extend_from_slice(&chunk[..n]);
        };
        if head_len >= self.max_header_size {
            warn!(max = self.max_header_size, "HTTP request head exceeds maximum size");
            return Ok(None);
        }
        connection.unread(&data[head_len + HEAD_TERMINATOR.len()..]);

        let Ok(head) = std::str::from_utf8(&data[..head_len]) else {
            warn!("HTTP request head is not valid UTF-8");
            return Ok(None);
        };
        let server_port = connection.local_port().unwrap_or(80);
        let Some(headers) = parse_http_head(head, server_port) else {
            warn!("Malformed HTTP request line");
            return Ok(None);
        };

        if !password_matches(
            self.connect_password.as_deref(),
            headers.get(HTTP_PASSWORD_HEADER),
        ) {
            warn!("Client sent an invalid connect password");
            return Ok(None);
        }
        Ok(Some(headers))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Turn an HTTP request head (without the blank line) into CGI-style headers.
///
/// Returns `None` when the request line is malformed.
pub fn parse_http_head(head: &str, server_port: u16) -> Option<Headers> {
    let mut lines = head.split("\r\n");
    let (method, uri, protocol) = parse_request_line(lines.next()?)?;

    let (path, query) = uri.split_once('?').unwrap_or((uri, ""));
    let mut headers = Headers::new();
    headers.insert("REQUEST_METHOD".to_string(), method.to_string());
    headers.insert("REQUEST_URI".to_string(), uri.to_string());
    headers.insert("QUERY_STRING".to_string(), query.to_string());
    headers.insert("SCRIPT_NAME".to_string(), String::new());
    headers.insert("PATH_INFO".to_string(), path.to_string());
    headers.insert("SERVER_NAME".to_string(), "127.0.0.1".to_string());
    headers.insert("SERVER_PORT".to_string(), server_port.to_string());
    headers.insert("SERVER_PROTOCOL".to_string(), protocol.to_string());

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_ascii_uppercase().replace('-', "_");
        if name.is_empty() {
            continue;
        }
        let key = match name.as_str() {
            "CONTENT_LENGTH" | "CONTENT_TYPE" => name,
            _ => format!("HTTP_{name}"),
        };
        headers.insert(key, value.trim().to_string());
    }
    Some(headers)
}

fn parse_request_line(line: &str) -> Option<(&str, &str, &str)> {
    let (method, rest) = line.split_once(' ')?;
    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_alphabetic()) {
        return None;
    }
    let (uri, protocol) = rest.rsplit_once(' ')?;
    if uri.is_empty() || !is_http_version(protocol) {
        return None;
    }
    Some((method, uri, protocol))
}

fn is_http_version(s: &str) -> bool {
    let Some(version) = s.strip_prefix("HTTP/") else {
        return false;
    };
    let bytes = version.as_bytes();
    bytes.len() == 3 && bytes[0].is_ascii_digit() && bytes[1] == b'.' && bytes[2].is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http_head() {
        let head = "GET /posts/1?page=2 HTTP/1.1\r\nHost: example.com\r\nX-Forwarded-For: 10.0.0.1\r\nContent-Type: text/plain\r\nContent-Length: 4";
        let headers = parse_http_head(head, 3000).unwrap();

        assert_eq!(headers["REQUEST_METHOD"], "GET");
        assert_eq!(headers["REQUEST_URI"], "/posts/1?page=2");
        assert_eq!(headers["PATH_INFO"], "/posts/1");
        assert_eq!(headers["QUERY_STRING"], "page=2");
        assert_eq!(headers["SCRIPT_NAME"], "");
        assert_eq!(headers["SERVER_NAME"], "127.0.0.1");
        assert_eq!(headers["SERVER_PORT"], "3000");
        assert_eq!(headers["SERVER_PROTOCOL"], "HTTP/1.1");
        assert_eq!(headers["HTTP_HOST"], "example.com");
        assert_eq!(headers["HTTP_X_FORWARDED_FOR"], "10.0.0.1");
        assert_eq!(headers["CONTENT_TYPE"], "text/plain");
        assert_eq!(headers["CONTENT_LENGTH"], "4");
        assert!(!headers.contains_key("HTTP_CONTENT_LENGTH"));
    }

    #[test]
    fn test_parse_http_head_skips_lines_without_colon() {
        let headers = parse_http_head("PING / HTTP/1.0\r\ngarbage line\r\nA: b", 80).unwrap();
        assert_eq!(headers["REQUEST_METHOD"], "PING");
        assert_eq!(headers["HTTP_A"], "b");
        assert!(!headers.keys().any(|k| k.contains("GARBAGE")));
    }

    #[test]
    fn test_parse_http_head_value_may_contain_colon() {
        let headers = parse_http_head("GET / HTTP/1.1\r\nReferer: http://a/b", 80).unwrap();
        assert_eq!(headers["HTTP_REFERER"], "http://a/b");
    }

    #[test]
    fn test_parse_request_line_rejects_malformed() {
        assert!(parse_http_head("GET /", 80).is_none());
        assert!(parse_http_head("GET / HTTP/1", 80).is_none());
        assert!(parse_http_head("G3T / HTTP/1.1", 80).is_none());
        assert!(parse_http_head(" / HTTP/1.1", 80).is_none());
        assert!(parse_http_head("", 80).is_none());
    }

    #[test]
    fn test_password_matches() {
        let given = "x".to_string();
        assert!(password_matches(None, None));
        assert!(password_matches(None, Some(&given)));
        assert!(password_matches(Some("x"), Some(&given)));
        assert!(!password_matches(Some("y"), Some(&given)));
        assert!(!password_matches(Some("y"), None));
    }
}
