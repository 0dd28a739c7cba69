//! Secure endpoint round trip with a throwaway certificate

use async_trait::async_trait;
use std::io::Write as _;
use std::time::Duration;
use tokio::sync::mpsc;
use wavesock::prelude::*;

struct Echo;

#[async_trait]
impl ConnectionHandler for Echo {
    async fn on_message(
        &self,
        conn: &Connection,
        message: &mut MessageReader<'_>,
        is_text: bool,
    ) {
        if let Ok(payload) = message.read_to_end().await {
            let _ = conn.send(std::io::Cursor::new(payload), is_text).await;
        }
    }
}

struct Notifier {
    events: mpsc::UnboundedSender<std::result::Result<String, String>>,
}

#[async_trait]
impl ConnectionHandler for Notifier {
    async fn on_open(&self, _conn: &Connection, _subprotocol: Option<&str>) {
        let _ = self.events.send(Ok("open".to_string()));
    }

    async fn on_message(
        &self,
        _conn: &Connection,
        message: &mut MessageReader<'_>,
        _is_text: bool,
    ) {
        match message.read_to_string().await {
            Ok(text) => {
                let _ = self.events.send(Ok(text));
            }
            Err(error) => {
                let _ = self.events.send(Err(error.to_string()));
            }
        }
    }

    async fn on_error(&self, _conn: &Connection, error: &Error) {
        let _ = self.events.send(Err(error.to_string()));
    }
}

#[tokio::test]
async fn wss_echo_round_trip() {
    // throwaway localhost certificate, trusted by the client as its CA
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_pem = cert.serialize_pem().unwrap();
    let key_pem = cert.serialize_private_key_pem();

    let mut cert_file = tempfile::NamedTempFile::new().unwrap();
    cert_file.write_all(cert_pem.as_bytes()).unwrap();
    let mut key_file = tempfile::NamedTempFile::new().unwrap();
    key_file.write_all(key_pem.as_bytes()).unwrap();

    let server = Endpoint::new();
    server.set_server_identity(ServerIdentity::new(cert_file.path(), key_file.path()));
    let acceptor = server
        .listen_secure(0, Echo, ConnectionConfig::default())
        .await
        .unwrap();
    assert!(acceptor.is_secure());

    let client = Endpoint::new();
    client.set_client_trust(ClientTrust::ca_file(cert_file.path()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = client
        .connect(
            &format!("wss://localhost:{}/secure", acceptor.port()),
            Notifier { events: tx },
            ConnectionConfig::default().with_handshake_timeout(Duration::from_secs(10)),
        )
        .await
        .unwrap();

    let opened = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for open")
        .unwrap();
    assert_eq!(opened.unwrap(), "open");
    assert!(conn.is_secure());
    assert!(conn.is_client_side());
    assert_eq!(conn.path().as_deref(), Some("/secure"));

    conn.send_text("hello over tls").await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for echo")
        .unwrap();
    assert_eq!(echoed.unwrap(), "hello over tls");

    conn.close(1000, "done").await;
}
