// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Channel tests over real sockets, including descriptor passing.

use std::io::{Read, Write};
use std::os::fd::AsFd;

use berth_protocol::session::{self, Headers};
use berth_protocol::{Channel, ChannelError};
use tokio::net::{TcpListener, TcpStream, UnixStream};

#[tokio::test]
async fn test_messages_over_unix_socket_pair() {
    let (a, b) = UnixStream::pair().unwrap();
    let mut left = Channel::new(a);
    let mut right = Channel::new(b);

    left.write_message(&["spawn", "app"]).await.unwrap();
    assert_eq!(
        right.read_message().await.unwrap().unwrap(),
        vec!["spawn", "app"]
    );

    right.write_message(&["ok"]).await.unwrap();
    drop(right);
    assert_eq!(left.read_message().await.unwrap().unwrap(), vec!["ok"]);
    assert!(left.read_message().await.unwrap().is_none());
}

#[tokio::test]
async fn test_session_block_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client = tokio::spawn(async move {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut channel = Channel::new(stream);
        let block = session::encode_headers([("REQUEST_METHOD", "GET"), ("PATH_INFO", "/")]);
        channel.write_scalar(&block).await.unwrap();
    });

    let (stream, _) = listener.accept().await.unwrap();
    let mut channel = Channel::new(stream);
    let block = channel.read_scalar(128 * 1024).await.unwrap().unwrap();
    let headers: Headers = session::decode_headers(&block).unwrap();
    assert_eq!(headers["REQUEST_METHOD"], "GET");
    assert_eq!(headers["PATH_INFO"], "/");
    client.await.unwrap();
}

#[tokio::test]
async fn test_pass_tcp_socket_descriptor() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server_side, _) = listener.accept().await.unwrap();
    let client_local = client.local_addr().unwrap();

    let (a, b) = UnixStream::pair().unwrap();
    let mut sender = Channel::new(a);
    let mut receiver = Channel::new(b);

    let server_std = server_side.into_std().unwrap();
    sender.send_fd(server_std.as_fd()).await.unwrap();
    let received = receiver.recv_fd().await.unwrap();
    drop(server_std);

    let mut passed = std::net::TcpStream::from(received);
    assert_eq!(passed.peer_addr().unwrap(), client_local);

    passed.set_nonblocking(false).unwrap();
    passed.write_all(b"through the pipe").unwrap();
    drop(passed);

    let mut client_std = client.into_std().unwrap();
    client_std.set_nonblocking(false).unwrap();
    let mut received_text = String::new();
    client_std.read_to_string(&mut received_text).unwrap();
    assert_eq!(received_text, "through the pipe");
}

#[tokio::test]
async fn test_negotiated_descriptor_passing() {
    let file = tempfile::tempfile().unwrap();
    let (a, b) = UnixStream::pair().unwrap();
    let mut sender = Channel::new(a);
    let mut receiver = Channel::new(b);

    let send = tokio::spawn(async move {
        sender.send_fd_negotiated(file.as_fd()).await.unwrap();
        file
    });
    let received = receiver.recv_fd_negotiated().await.unwrap();
    let mut original = send.await.unwrap();

    let mut passed = std::fs::File::from(received);
    passed.write_all(b"shared").unwrap();

    use std::io::{Seek, SeekFrom};
    original.seek(SeekFrom::Start(0)).unwrap();
    let mut contents = String::new();
    original.read_to_string(&mut contents).unwrap();
    assert_eq!(contents, "shared");
}

#[tokio::test]
async fn test_recv_fd_without_descriptor() {
    let (a, b) = UnixStream::pair().unwrap();
    let mut sender = Channel::new(a);
    let mut receiver = Channel::new(b);

    sender.write_scalar(b"x").await.unwrap();
    let err = receiver.recv_fd().await.unwrap_err();
    assert!(matches!(err, ChannelError::NoDescriptor));
}

#[tokio::test]
async fn test_negotiation_rejects_unexpected_message() {
    let (a, b) = UnixStream::pair().unwrap();
    let mut sender = Channel::new(a);
    let mut peer = Channel::new(b);

    peer.write_message(&["hello"]).await.unwrap();
    let file = tempfile::tempfile().unwrap();
    let err = sender.send_fd_negotiated(file.as_fd()).await.unwrap_err();
    match err {
        ChannelError::UnexpectedNegotiation { expected, actual } => {
            assert_eq!(expected, "pass IO");
            assert_eq!(actual, Some(vec!["hello".to_string()]));
        }
        other => panic!("unexpected error: {other}"),
    }
}
