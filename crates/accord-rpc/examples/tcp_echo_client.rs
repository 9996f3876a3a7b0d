//! Connects to the echo server and performs one round trip.
//!
//! First start the server: `cargo run --example tcp_echo_server`

use std::time::Duration;

use accord_rpc::{ClientSession, RpcStatus, ServerAddress};
use bytes::Bytes;
use tokio::time::Instant;

const MAX_MESSAGE_LENGTH: u32 = 1 << 20;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let address = ServerAddress::resolve("127.0.0.1:5254");
    let session = ClientSession::connect(
        address,
        MAX_MESSAGE_LENGTH,
        Instant::now() + Duration::from_secs(5),
    )
    .await;
    println!("{session}");

    let mut rpc = session
        .send_request(Bytes::from_static(b"hello, consensus"))
        .await;
    rpc.wait(Some(Instant::now() + Duration::from_secs(5))).await;
    rpc.update();

    match rpc.status() {
        RpcStatus::Ok => {
            println!("reply: {}", String::from_utf8_lossy(rpc.reply()));
        }
        RpcStatus::NotReady => println!("no reply before the deadline"),
        RpcStatus::Error => println!("session failed: {}", rpc.error_message()),
        RpcStatus::Canceled => println!("cancelled"),
    }

    Ok(())
}
