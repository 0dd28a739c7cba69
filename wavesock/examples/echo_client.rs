//! Echo Client Example
//!
//! Connects to the echo server, sends a handful of messages and prints
//! what comes back.

use async_trait::async_trait;
use std::time::Duration;
use wavesock::prelude::*;

struct PrintHandler;

#[async_trait]
impl ConnectionHandler for PrintHandler {
    async fn on_open(&self, _conn: &Connection, subprotocol: Option<&str>) {
        println!("connected (subprotocol {subprotocol:?})");
    }

    async fn on_message(
        &self,
        _conn: &Connection,
        message: &mut MessageReader<'_>,
        is_text: bool,
    ) {
        if is_text {
            match message.read_to_string().await {
                Ok(text) => println!("echo: {text}"),
                Err(error) => eprintln!("receive failed: {error}"),
            }
        } else {
            match message.read_to_end().await {
                Ok(payload) => println!("echo: {} binary bytes", payload.len()),
                Err(error) => eprintln!("receive failed: {error}"),
            }
        }
    }

    async fn on_error(&self, _conn: &Connection, error: &Error) {
        eprintln!("connection error: {error}");
    }

    async fn on_close(&self, _conn: &Connection, status: CloseStatus) {
        println!("closed: code {} clean {}", status.code, status.was_clean);
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    wavesock::logging::init()?;

    let endpoint = Endpoint::new();
    let conn = endpoint
        .connect(
            "ws://127.0.0.1:8080/echo",
            PrintHandler,
            ConnectionConfig::default(),
        )
        .await?;

    // the handshake runs in the background; wait for it
    while !conn.is_open() {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if conn.status().error.is_some() {
            return Err("connect failed".into());
        }
    }

    conn.send_text("hello").await?;
    conn.send_binary([1u8, 2, 3, 4]).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    conn.close(1000, "done").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}
