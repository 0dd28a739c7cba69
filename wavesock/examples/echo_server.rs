//! Echo Server Example
//!
//! A WebSocket server that echoes every message back to its sender.
//! Connect with `cargo run --example echo_client` or any WebSocket
//! client on ws://127.0.0.1:8080.

use async_trait::async_trait;
use wavesock::prelude::*;

struct EchoHandler;

#[async_trait]
impl ConnectionHandler for EchoHandler {
    async fn on_open(&self, conn: &Connection, subprotocol: Option<&str>) {
        println!(
            "connection {} open (peer {:?}, subprotocol {:?})",
            conn.id(),
            conn.peer_host(),
            subprotocol
        );
    }

    async fn on_message(
        &self,
        conn: &Connection,
        message: &mut MessageReader<'_>,
        is_text: bool,
    ) {
        match message.read_to_end().await {
            Ok(payload) => {
                println!(
                    "connection {}: {} bytes ({})",
                    conn.id(),
                    payload.len(),
                    if is_text { "text" } else { "binary" }
                );
                if let Err(error) = conn.send(std::io::Cursor::new(payload), is_text).await {
                    eprintln!("echo failed: {error}");
                }
            }
            Err(error) => eprintln!("receive failed: {error}"),
        }
    }

    async fn on_close(&self, conn: &Connection, status: CloseStatus) {
        println!(
            "connection {} closed: code {} reason {:?} clean {}",
            conn.id(),
            status.code,
            status.reason,
            status.was_clean
        );
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    wavesock::logging::init()?;

    let endpoint = Endpoint::new();
    let acceptor = endpoint
        .listen(8080, EchoHandler, ConnectionConfig::default())
        .await?;
    println!("echo server listening on ws://127.0.0.1:{}", acceptor.port());

    tokio::signal::ctrl_c().await?;
    endpoint.close_all("server going down").await;
    Ok(())
}
