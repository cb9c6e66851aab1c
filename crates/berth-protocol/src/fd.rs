// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! File descriptor passing over Unix domain sockets.
//!
//! A descriptor travels as an `SCM_RIGHTS` control message attached to a
//! single placeholder byte. These methods exist only on
//! `Channel<UnixStream>`; other transports cannot carry descriptors.
//!
//! The negotiated variants bracket the transfer with a "pass IO" request from
//! the receiver and a "got IO" acknowledgement, so the sender knows the
//! descriptor arrived before it closes its own copy.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use tokio::io::Interest;
use tokio::net::UnixStream;
use tracing::debug;

use crate::channel::{Channel, ChannelError};

const PLACEHOLDER: [u8; 1] = [b'\0'];

/// Receiver asks the sender to pass the descriptor
pub const PASS_IO: &str = "pass IO";

/// Receiver confirms the descriptor arrived
pub const GOT_IO: &str = "got IO";

impl Channel<UnixStream> {
    /// Send one descriptor to the peer.
    ///
    /// The caller keeps its own copy of `fd`; closing it is the caller's job.
    pub async fn send_fd(&mut self, fd: BorrowedFd<'_>) -> Result<(), ChannelError> {
        let stream = self.get_ref();
        let socket = stream.as_raw_fd();
        let fds = [fd.as_raw_fd()];

        let sent = stream
            .async_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(&PLACEHOLDER)];
                let cmsgs = [ControlMessage::ScmRights(&fds)];
                sendmsg::<()>(socket, &iov, &cmsgs, MsgFlags::empty(), None).map_err(io::Error::from)
            })
            .await?;
        if sent == 0 {
            return Err(io::Error::from(io::ErrorKind::WriteZero).into());
        }
        Ok(())
    }

    /// Receive one descriptor from the peer.
    ///
    /// The returned descriptor is close-on-exec. Extra descriptors in the same
    /// control message are closed.
    pub async fn recv_fd(&mut self) -> Result<OwnedFd, ChannelError> {
        let stream = self.get_ref();
        let socket = stream.as_raw_fd();

        let (bytes, received) = stream
            .async_io(Interest::READABLE, || {
                let mut byte = [0u8; 1];
                let mut iov = [IoSliceMut::new(&mut byte)];
                let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
                let msg = recvmsg::<()>(
                    socket,
                    &mut iov,
                    Some(&mut cmsg_buffer),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                )
                .map_err(io::Error::from)?;

                let mut received: Option<OwnedFd> = None;
                for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        for raw in fds {
                            // SAFETY: the kernel just installed `raw` in our table and
                            // nothing else refers to it yet.
                            let owned = unsafe { OwnedFd::from_raw_fd(raw) };
                            if received.is_none() {
                                received = Some(owned);
                            }
                        }
                    }
                }
                Ok((msg.bytes, received))
            })
            .await?;

        match received {
            Some(fd) => Ok(fd),
            None if bytes == 0 => Err(ChannelError::Truncated),
            None => Err(ChannelError::NoDescriptor),
        }
    }

    /// Send a descriptor once the peer asks for it, then wait for its receipt.
    pub async fn send_fd_negotiated(&mut self, fd: BorrowedFd<'_>) -> Result<(), ChannelError> {
        self.expect_message(PASS_IO).await?;
        self.send_fd(fd).await?;
        self.expect_message(GOT_IO).await?;
        debug!(fd = fd.as_raw_fd(), "Descriptor passed");
        Ok(())
    }

    /// Ask the peer for a descriptor, receive it and acknowledge it.
    pub async fn recv_fd_negotiated(&mut self) -> Result<OwnedFd, ChannelError> {
        self.write_message(&[PASS_IO]).await?;
        let fd = self.recv_fd().await?;
        self.write_message(&[GOT_IO]).await?;
        Ok(fd)
    }

    async fn expect_message(&mut self, expected: &'static str) -> Result<(), ChannelError> {
        let message = self.read_message().await?;
        match message.as_deref() {
            Some([field]) if field == expected => Ok(()),
            _ => Err(ChannelError::UnexpectedNegotiation {
                expected,
                actual: message,
            }),
        }
    }
}
