// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Listening sockets and client connections over TCP or Unix sockets.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use berth_protocol::ServerAddress;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

/// A bound listening socket.
///
/// Several dispatch loops may serve the same socket; give each one its own
/// [`Listener::try_clone`].
#[derive(Debug)]
pub enum Listener {
    Tcp(std::net::TcpListener),
    Unix(std::os::unix::net::UnixListener),
}

impl Listener {
    /// Bind `address`. A TCP port of 0 picks a free port.
    pub fn bind(address: &ServerAddress) -> io::Result<Self> {
        match address {
            ServerAddress::Tcp(host_port) => {
                Ok(Listener::Tcp(std::net::TcpListener::bind(host_port.as_str())?))
            }
            ServerAddress::Unix(path) => Ok(Listener::Unix(std::os::unix::net::UnixListener::bind(path)?)),
        }
    }

    /// The address clients should connect to
    pub fn local_address(&self) -> io::Result<ServerAddress> {
        match self {
            Listener::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(ServerAddress::tcp(&addr.ip().to_string(), addr.port()))
            }
            Listener::Unix(listener) => {
                let addr = listener.local_addr()?;
                let path = addr.as_pathname().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "unnamed Unix socket")
                })?;
                Ok(ServerAddress::unix(path))
            }
        }
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            Listener::Tcp(listener) => Ok(Listener::Tcp(listener.try_clone()?)),
            Listener::Unix(listener) => Ok(Listener::Unix(listener.try_clone()?)),
        }
    }

    /// Register with the current runtime. Must be called from inside it.
    pub(crate) fn into_async(self) -> io::Result<AsyncListener> {
        match self {
            Listener::Tcp(listener) => {
                listener.set_nonblocking(true)?;
                Ok(AsyncListener::Tcp(tokio::net::TcpListener::from_std(listener)?))
            }
            Listener::Unix(listener) => {
                listener.set_nonblocking(true)?;
                Ok(AsyncListener::Unix(tokio::net::UnixListener::from_std(listener)?))
            }
        }
    }
}

pub(crate) enum AsyncListener {
    Tcp(tokio::net::TcpListener),
    Unix(tokio::net::UnixListener),
}

impl AsyncListener {
    /// Accept one client. Cancel safe.
    pub(crate) async fn accept(&self) -> io::Result<Connection> {
        match self {
            AsyncListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(stream.into())
            }
            AsyncListener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(stream.into())
            }
        }
    }
}

#[derive(Debug)]
enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

/// A client connection.
///
/// Bytes a parser read past the end of a request head are pushed back with
/// [`Connection::unread`] and returned by the next reads.
///
/// The kind of the last I/O error raised by the socket is remembered, so an
/// error surfacing from a request processor can be traced back to the client.
#[derive(Debug)]
pub struct Connection {
    stream: Stream,
    unread: Vec<u8>,
    socket_error: Option<io::ErrorKind>,
}

impl From<TcpStream> for Connection {
    fn from(stream: TcpStream) -> Self {
        Self {
            stream: Stream::Tcp(stream),
            unread: Vec::new(),
            socket_error: None,
        }
    }
}

impl From<UnixStream> for Connection {
    fn from(stream: UnixStream) -> Self {
        Self {
            stream: Stream::Unix(stream),
            unread: Vec::new(),
            socket_error: None,
        }
    }
}

impl Connection {
    /// Connect to a worker socket.
    pub async fn connect(address: &ServerAddress) -> io::Result<Self> {
        match address {
            ServerAddress::Tcp(host_port) => Ok(TcpStream::connect(host_port.as_str()).await?.into()),
            ServerAddress::Unix(path) => Ok(UnixStream::connect(path).await?.into()),
        }
    }

    /// Wait until the connection has data or has been closed by the peer.
    pub async fn readable(&self) -> io::Result<()> {
        if !self.unread.is_empty() {
            return Ok(());
        }
        match &self.stream {
            Stream::Tcp(stream) => stream.readable().await,
            Stream::Unix(stream) => stream.readable().await,
        }
    }

    /// Local TCP port, if this is a TCP connection
    pub fn local_port(&self) -> Option<u16> {
        match &self.stream {
            Stream::Tcp(stream) => stream.local_addr().ok().map(|a| a.port()),
            Stream::Unix(_) => None,
        }
    }

    pub fn is_unix(&self) -> bool {
        matches!(self.stream, Stream::Unix(_))
    }

    /// Push `data` back so it is read before anything else.
    pub fn unread(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut buffered = data.to_vec();
        buffered.append(&mut self.unread);
        self.unread = buffered;
    }

    /// Whether `err` is the last error this connection's socket raised.
    pub fn is_source_of(&self, err: &io::Error) -> bool {
        self.socket_error == Some(err.kind())
    }

    fn record<T>(&mut self, poll: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
        if let Poll::Ready(Err(e)) = &poll {
            self.socket_error = Some(e.kind());
        }
        poll
    }

    /// Shut down the write side, then drop the connection.
    ///
    /// Errors are ignored; the peer may already be gone.
    pub async fn close(mut self) {
        let _ = self.shutdown().await;
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.unread.is_empty() {
            let n = this.unread.len().min(buf.remaining());
            buf.put_slice(&this.unread[..n]);
            this.unread.drain(..n);
            return Poll::Ready(Ok(()));
        }
        let poll = match &mut this.stream {
            Stream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Stream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        };
        this.record(poll)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = match &mut this.stream {
            Stream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Stream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        };
        this.record(poll)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = match &mut this.stream {
            Stream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Stream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        };
        this.record(poll)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = match &mut this.stream {
            Stream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Stream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        };
        this.record(poll)
    }
}
