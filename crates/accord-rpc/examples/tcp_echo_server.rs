//! Minimal echo peer for the accord-rpc client session.
//!
//! Echoes every frame back with the same message ID, which also answers
//! liveness pings (ID 0). Start the server, then run the client:
//!
//! ```text
//! cargo run --example tcp_echo_server
//! cargo run --example tcp_echo_client
//! ```

use accord_rpc::{StreamTransport, Transport};
use tokio::net::TcpListener;
use tracing::{info, warn};

const MAX_MESSAGE_LENGTH: u32 = 1 << 20;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let listener = TcpListener::bind("127.0.0.1:5254").await?;
    info!("echo server listening on 127.0.0.1:5254");

    loop {
        let (sock, peer_addr) = listener.accept().await?;
        info!(%peer_addr, "accepted connection");
        tokio::spawn(async move {
            let transport = StreamTransport::new(sock, MAX_MESSAGE_LENGTH);
            loop {
                let frame = match transport.recv_frame().await {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(%peer_addr, error = %e, "connection done");
                        return;
                    }
                };
                if transport.send_frame(frame).await.is_err() {
                    return;
                }
            }
        });
    }
}
