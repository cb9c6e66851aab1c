// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session request header block.
//!
//! A session request is one scalar whose payload is
//! `key\0value\0key\0value\0...`. A single trailing NUL is tolerated.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::channel::ChannelError;

/// Request headers, CGI-style names to values
pub type Headers = HashMap<String, String>;

/// Encode header pairs into a session header block
pub fn encode_headers<K, V, I>(pairs: I) -> Bytes
where
    K: AsRef<str>,
    V: AsRef<str>,
    I: IntoIterator<Item = (K, V)>,
{
    let mut buf = BytesMut::new();
    for (key, value) in pairs {
        buf.put_slice(key.as_ref().as_bytes());
        buf.put_u8(0);
        buf.put_slice(value.as_ref().as_bytes());
        buf.put_u8(0);
    }
    buf.freeze()
}

/// Decode a session header block.
///
/// An odd number of fields or non-UTF-8 content makes the block invalid.
pub fn decode_headers(block: &[u8]) -> Result<Headers, ChannelError> {
    let block = block.strip_suffix(b"\0").unwrap_or(block);
    if block.is_empty() {
        return Ok(Headers::new());
    }

    let fields: Vec<&[u8]> = block.split(|b| *b == 0).collect();
    if fields.len() % 2 != 0 {
        return Err(ChannelError::OddFieldCount(fields.len()));
    }

    let mut headers = Headers::with_capacity(fields.len() / 2);
    for pair in fields.chunks_exact(2) {
        let key = String::from_utf8(pair[0].to_vec())?;
        let value = String::from_utf8(pair[1].to_vec())?;
        headers.insert(key, value);
    }
    Ok(headers)
}
