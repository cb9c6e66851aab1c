// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for the framing channel.
//!
//! Two frame shapes share one byte stream:
//! - Message: a run of text fields, each a 2-byte big-endian length followed
//!   by that many bytes, terminated by a zero-length field.
//! - Scalar: a 4-byte big-endian length followed by an opaque payload.
//!
//! The channel never interprets payloads. It only enforces size limits and
//! reports a peer that disappears in the middle of a frame as [`ChannelError::Truncated`],
//! which is distinct from a clean end-of-stream (`Ok(None)`).

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Field header size (2 bytes length)
pub const FIELD_HEADER_SIZE: usize = 2;

/// Scalar header size (4 bytes length)
pub const SCALAR_HEADER_SIZE: usize = 4;

/// Default cap on a single message field (4 KB)
pub const DEFAULT_MAX_FIELD_SIZE: usize = 4 * 1024;

/// Default cap on the encoded size of a whole message (64 KB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Errors that can occur while reading or writing frames
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChannelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed in the middle of a frame")]
    Truncated,

    #[error("message field too large: {size} bytes (max: {max})")]
    FieldTooLarge { size: usize, max: usize },

    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("message fields must not be empty")]
    EmptyField,

    #[error("scalar size {size} exceeds maximum allowed size {max}")]
    SizeExceeded { size: u64, max: usize },

    #[error("message field is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("message has an odd number of fields ({0})")]
    OddFieldCount(usize),

    #[error("no file descriptor received")]
    NoDescriptor,

    #[error("unexpected negotiation message: expected {expected:?}, got {actual:?}")]
    UnexpectedNegotiation {
        expected: &'static str,
        actual: Option<Vec<String>>,
    },
}

impl ChannelError {
    /// True when the peer went away, either mid-frame or with a socket error
    /// that only a vanished peer produces.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ChannelError::Truncated => true,
            ChannelError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Encode a message into its wire form.
///
/// Fails before anything is produced if a field is empty (it would read back
/// as the terminator) or a size limit is exceeded.
pub fn encode_message<T: AsRef<str>>(
    fields: &[T],
    max_field_size: usize,
    max_message_size: usize,
) -> Result<Bytes, ChannelError> {
    let max_field_size = max_field_size.min(u16::MAX as usize);
    let mut size = FIELD_HEADER_SIZE;
    for field in fields {
        let len = field.as_ref().len();
        if len == 0 {
            return Err(ChannelError::EmptyField);
        }
        if len > max_field_size {
            return Err(ChannelError::FieldTooLarge {
                size: len,
                max: max_field_size,
            });
        }
        size += FIELD_HEADER_SIZE + len;
    }
    if size > max_message_size {
        return Err(ChannelError::MessageTooLarge {
            size,
            max: max_message_size,
        });
    }

    let mut buf = BytesMut::with_capacity(size);
    for field in fields {
        let field = field.as_ref();
        buf.put_u16(field.len() as u16);
        buf.put_slice(field.as_bytes());
    }
    buf.put_u16(0);
    Ok(buf.freeze())
}

/// Encode a scalar into its wire form
pub fn encode_scalar(data: &[u8]) -> Result<Bytes, ChannelError> {
    let len = u32::try_from(data.len()).map_err(|_| ChannelError::SizeExceeded {
        size: data.len() as u64,
        max: u32::MAX as usize,
    })?;
    let mut buf = BytesMut::with_capacity(SCALAR_HEADER_SIZE + data.len());
    buf.put_u32(len);
    buf.put_slice(data);
    Ok(buf.freeze())
}

/// Fill `buf` completely.
///
/// Returns `Ok(false)` if the stream ended before the first byte, and
/// [`ChannelError::Truncated`] if it ended after some but not all bytes.
async fn read_header<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<bool, ChannelError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(ChannelError::Truncated);
        }
        filled += n;
    }
    Ok(true)
}

async fn read_payload<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), ChannelError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ChannelError::Truncated),
        Err(e) => Err(e.into()),
    }
}

/// Framed channel over any byte stream.
///
/// A channel is owned by one task; it does not support concurrent readers
/// or concurrent writers.
pub struct Channel<S> {
    stream: S,
    max_field_size: usize,
    max_message_size: usize,
}

impl<S> Channel<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            max_field_size: DEFAULT_MAX_FIELD_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Override the message size limits.
    ///
    /// Field sizes are additionally clamped to what a 2-byte length can express.
    pub fn with_limits(mut self, max_field_size: usize, max_message_size: usize) -> Self {
        self.max_field_size = max_field_size.min(u16::MAX as usize);
        self.max_message_size = max_message_size;
        self
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncWrite + Unpin> Channel<S> {
    /// Write one message and flush it.
    pub async fn write_message<T: AsRef<str>>(&mut self, fields: &[T]) -> Result<(), ChannelError> {
        let encoded = encode_message(fields, self.max_field_size, self.max_message_size)?;
        self.stream.write_all(&encoded).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Write one scalar and flush it.
    pub async fn write_scalar(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        let encoded = encode_scalar(data)?;
        self.stream.write_all(&encoded).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> Channel<S> {
    /// Read the next message.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly before any part of a
    /// message. A message with zero fields reads back as `Some(vec![])`.
    pub async fn read_message(&mut self) -> Result<Option<Vec<String>>, ChannelError> {
        let mut fields = Vec::new();
        let mut size = 0usize;
        let mut header = [0u8; FIELD_HEADER_SIZE];

        if !read_header(&mut self.stream, &mut header).await? {
            return Ok(None);
        }
        loop {
            size += FIELD_HEADER_SIZE;
            let len = u16::from_be_bytes(header) as usize;
            if len == 0 {
                return Ok(Some(fields));
            }
            if len > self.max_field_size {
                return Err(ChannelError::FieldTooLarge {
                    size: len,
                    max: self.max_field_size,
                });
            }
            size += len;
            if size > self.max_message_size {
                return Err(ChannelError::MessageTooLarge {
                    size,
                    max: self.max_message_size,
                });
            }

            let mut payload = vec![0u8; len];
            read_payload(&mut self.stream, &mut payload).await?;
            fields.push(String::from_utf8(payload)?);

            if !read_header(&mut self.stream, &mut header).await? {
                return Err(ChannelError::Truncated);
            }
        }
    }

    /// Read a message and pair up its fields as `key, value, key, value, ...`.
    ///
    /// Later duplicates of a key replace earlier ones.
    pub async fn read_hash(&mut self) -> Result<Option<HashMap<String, String>>, ChannelError> {
        let Some(fields) = self.read_message().await? else {
            return Ok(None);
        };
        if fields.len() % 2 != 0 {
            return Err(ChannelError::OddFieldCount(fields.len()));
        }
        let mut map = HashMap::with_capacity(fields.len() / 2);
        let mut iter = fields.into_iter();
        while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
            map.insert(key, value);
        }
        Ok(Some(map))
    }

    /// Read the next scalar, refusing payloads larger than `max_size`.
    ///
    /// On [`ChannelError::SizeExceeded`] only the 4-byte header has been
    /// consumed; the payload is left unread on the stream.
    pub async fn read_scalar(&mut self, max_size: usize) -> Result<Option<Bytes>, ChannelError> {
        let mut header = [0u8; SCALAR_HEADER_SIZE];
        if !read_header(&mut self.stream, &mut header).await? {
            return Ok(None);
        }
        let len = u32::from_be_bytes(header);
        if len as u64 > max_size as u64 {
            return Err(ChannelError::SizeExceeded {
                size: len as u64,
                max: max_size,
            });
        }

        let mut payload = vec![0u8; len as usize];
        read_payload(&mut self.stream, &mut payload).await?;
        Ok(Some(Bytes::from(payload)))
    }
}
