//! End-to-end tests over real TCP sockets.

use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::time::Instant;

use accord_rpc::{ClientSession, RpcStatus, StreamTransport, Transport};

const MAX_MESSAGE_LENGTH: u32 = 1 << 16;

/// Accept one connection and echo every frame back (pings included).
async fn serve_one_echo(listener: TcpListener) {
    let (sock, _) = listener.accept().await.expect("accept");
    let transport = StreamTransport::new(sock, MAX_MESSAGE_LENGTH);
    while let Ok(frame) = transport.recv_frame().await {
        if transport.send_frame(frame).await.is_err() {
            break;
        }
    }
}

#[tokio::test]
async fn connect_and_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve_one_echo(listener));

    let session = ClientSession::connect(
        addr.into(),
        MAX_MESSAGE_LENGTH,
        Instant::now() + Duration::from_secs(5),
    )
    .await;
    assert!(session.error_message().is_empty(), "{}", session.error_message());
    assert_eq!(session.to_string(), format!("Active session to {addr}"));

    let mut rpc = session.send_request(Bytes::from_static(b"over tcp")).await;
    rpc.wait(Some(Instant::now() + Duration::from_secs(5))).await;
    rpc.update();
    assert_eq!(rpc.status(), RpcStatus::Ok);
    assert_eq!(rpc.reply(), b"over tcp");
    assert_eq!(session.active_rpcs(), 0);

    drop(session);
    server.abort();
}

#[tokio::test]
async fn server_hangup_fails_the_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (sock, _) = listener.accept().await.expect("accept");
        let transport = StreamTransport::new(sock, MAX_MESSAGE_LENGTH);
        // Echo a single frame, then hang up.
        let frame = transport.recv_frame().await.expect("first frame");
        transport.send_frame(frame).await.expect("echo");
    });

    let session = ClientSession::connect(
        addr.into(),
        MAX_MESSAGE_LENGTH,
        Instant::now() + Duration::from_secs(5),
    )
    .await;

    let mut rpc = session.send_request(Bytes::from_static(b"one")).await;
    rpc.wait(Some(Instant::now() + Duration::from_secs(5))).await;
    rpc.update();
    assert_eq!(rpc.status(), RpcStatus::Ok);

    server.await.unwrap();

    // The demux task observes EOF shortly after the server goes away.
    let deadline = Instant::now() + Duration::from_secs(5);
    while session.error_message().is_empty() {
        assert!(Instant::now() < deadline, "session never noticed the hangup");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        session.error_message(),
        format!("Disconnected from server {addr}")
    );

    let mut rpc2 = session.send_request(Bytes::from_static(b"two")).await;
    rpc2.update();
    assert_eq!(rpc2.status(), RpcStatus::Error);
}

#[tokio::test]
async fn connection_refused_yields_born_dead_session() {
    // Bind to get a port the kernel just freed, then connect to it closed.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let session = ClientSession::connect(
        addr.into(),
        MAX_MESSAGE_LENGTH,
        Instant::now() + Duration::from_secs(5),
    )
    .await;
    let error = session.error_message();
    assert!(
        error.starts_with(&format!("Failed to connect socket to {addr}:")),
        "unexpected error: {error}"
    );

    // A born-dead session still hands out RPC handles.
    let mut rpc = session.send_request(Bytes::from_static(b"req")).await;
    rpc.wait(None).await;
    rpc.update();
    assert_eq!(rpc.status(), RpcStatus::Error);
    assert_eq!(rpc.error_message(), error);
}

#[tokio::test]
async fn client_connect_helper_is_usable_with_resolved_text() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve_one_echo(listener));

    // Exercise the resolve() path with a literal host:port.
    let address = accord_rpc::ServerAddress::resolve(&addr.to_string());
    assert!(address.is_valid());

    let session = ClientSession::connect(
        address,
        MAX_MESSAGE_LENGTH,
        Instant::now() + Duration::from_secs(5),
    )
    .await;
    let mut rpc = session.send_request(Bytes::from_static(b"hi")).await;
    rpc.wait(Some(Instant::now() + Duration::from_secs(5))).await;
    rpc.update();
    assert_eq!(rpc.status(), RpcStatus::Ok);

    drop(session);
    server.abort();
}
