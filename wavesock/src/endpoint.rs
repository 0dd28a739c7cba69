//! Endpoint facade
//!
//! Creates client connections and listening acceptors, keeps the
//! process-wide registries, and carries the TLS identity and trust
//! material. A single [`Endpoint::close_all`] shuts everything down.

use crate::acceptor::Acceptor;
use crate::connection::Connection;
use crate::handler::ConnectionHandler;
use crate::registry::ConnectionRegistry;
use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use url::Url;
use wavesock_core::error::ConfigError;
use wavesock_core::protocol::constants::{DEFAULT_PORT, DEFAULT_TLS_PORT};
use wavesock_core::status::close_code;
use wavesock_core::{ConnectionConfig, Listener, Result};
use wavesock_transport_tcp::TcpTransport;
use wavesock_transport_tls::{ClientTrust, ServerIdentity, TlsTransport};

/// WebSocket endpoint: connection factory and registry owner
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

struct Inner {
    bind_addr: Option<IpAddr>,
    connections: ConnectionRegistry,
    acceptors: Arc<StdMutex<Vec<Acceptor>>>,
    identity: StdMutex<Option<ServerIdentity>>,
    trust: StdMutex<Option<ClientTrust>>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("bind_addr", &self.inner.bind_addr)
            .field("connections", &self.inner.connections.len())
            .field("acceptors", &self.acceptors().len())
            .finish()
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_ignoring_poison<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Endpoint {
    /// Create an endpoint binding sockets to the unspecified address
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create an endpoint whose sockets bind to `addr`
    pub fn with_bind_addr(addr: IpAddr) -> Self {
        Self::build(Some(addr))
    }

    fn build(bind_addr: Option<IpAddr>) -> Self {
        Self {
            inner: Arc::new(Inner {
                bind_addr,
                connections: ConnectionRegistry::new(),
                acceptors: Arc::new(StdMutex::new(Vec::new())),
                identity: StdMutex::new(None),
                trust: StdMutex::new(None),
            }),
        }
    }

    /// Install the server identity used by [`Endpoint::listen_secure`]
    pub fn set_server_identity(&self, identity: ServerIdentity) {
        *lock_ignoring_poison(&self.inner.identity) = Some(identity);
    }

    /// Install the trust material used to validate `wss` peers; defaults
    /// to the bundled web PKI roots
    pub fn set_client_trust(&self, trust: ClientTrust) {
        *lock_ignoring_poison(&self.inner.trust) = Some(trust);
    }

    /// Open a client connection to `uri` (`ws://` or `wss://`) and spawn
    /// its reader task. Returns as soon as the task is started; `on_open`
    /// fires once the handshake completes.
    pub async fn connect(
        &self,
        uri: &str,
        handler: impl ConnectionHandler,
        config: ConnectionConfig,
    ) -> Result<Connection> {
        config.validate()?;
        let url = Url::parse(uri)
            .map_err(|e| ConfigError::InvalidUri(format!("{uri}: {e}")))?;
        let secure = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(
                    ConfigError::InvalidUri(format!("unsupported scheme {other:?}")).into(),
                )
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidUri(format!("{uri}: host required")))?
            .to_string();
        let port = url
            .port_or_known_default()
            .unwrap_or(if secure { DEFAULT_TLS_PORT } else { DEFAULT_PORT });

        let deadline = config.handshake_timeout;
        let (stream, peer) = if secure {
            let trust = lock_ignoring_poison(&self.inner.trust)
                .clone()
                .unwrap_or_default();
            let tls_config = Arc::new(wavesock_transport_tls::client_config(&trust)?);
            wavesock_transport_tls::connect(
                &host,
                port,
                self.inner.bind_addr,
                &host,
                tls_config,
                deadline,
            )
            .await?
        } else {
            wavesock_transport_tcp::connect_host(&host, port, self.inner.bind_addr, deadline)
                .await?
        };

        tracing::debug!(%uri, %peer, "connecting");
        let conn = Connection::client(
            stream,
            peer,
            url,
            Arc::new(handler),
            config,
            self.inner.connections.clone(),
        );
        tokio::spawn(conn.clone().run());
        Ok(conn)
    }

    /// Listen for plain-socket connections on `port`
    pub async fn listen(
        &self,
        port: u16,
        handler: impl ConnectionHandler,
        config: ConnectionConfig,
    ) -> Result<Acceptor> {
        config.validate()?;
        let listener = TcpTransport::bind(self.inner.bind_addr, port).await?;
        self.spawn_acceptor(Box::new(listener), false, Arc::new(handler), config)
    }

    /// Listen for TLS connections on `port`, serving the configured
    /// server identity
    pub async fn listen_secure(
        &self,
        port: u16,
        handler: impl ConnectionHandler,
        config: ConnectionConfig,
    ) -> Result<Acceptor> {
        config.validate()?;
        let identity = lock_ignoring_poison(&self.inner.identity)
            .clone()
            .ok_or_else(|| {
                ConfigError::Validation("server identity not configured".to_string())
            })?;
        let listener = TlsTransport::bind(self.inner.bind_addr, port, &identity).await?;
        self.spawn_acceptor(Box::new(listener), true, Arc::new(handler), config)
    }

    fn spawn_acceptor(
        &self,
        listener: Box<dyn Listener>,
        secure: bool,
        handler: Arc<dyn ConnectionHandler>,
        config: ConnectionConfig,
    ) -> Result<Acceptor> {
        let acceptor = Acceptor::new(
            listener,
            secure,
            handler,
            config,
            self.inner.acceptors.clone(),
        )?;
        lock_ignoring_poison(&self.inner.acceptors).push(acceptor.clone());
        tokio::spawn(acceptor.clone().run());
        Ok(acceptor)
    }

    /// Close every acceptor, then every connection, with GOING_AWAY and
    /// the given reason. Safe to call while new connections arrive.
    pub async fn close_all(&self, reason: &str) {
        let acceptors = self.acceptors();
        for acceptor in acceptors {
            acceptor.close(reason).await;
        }
        for conn in self.inner.connections.list() {
            conn.close(close_code::GOING_AWAY, reason).await;
        }
    }

    /// Snapshot of the client connections opened through this endpoint
    pub fn connections(&self) -> Vec<Connection> {
        self.inner.connections.list()
    }

    /// Snapshot of the live acceptors
    pub fn acceptors(&self) -> Vec<Acceptor> {
        lock_ignoring_poison(&self.inner.acceptors).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;
    impl ConnectionHandler for NullHandler {}

    #[tokio::test]
    async fn connect_rejects_bad_uris() {
        let endpoint = Endpoint::new();

        let err = endpoint
            .connect("http://example.com/", NullHandler, ConnectionConfig::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));

        let err = endpoint
            .connect("not a uri", NullHandler, ConnectionConfig::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid URI"));
    }

    #[tokio::test]
    async fn connect_validates_config() {
        let endpoint = Endpoint::new();
        let config = ConnectionConfig::default().with_payload_buffer_len(1);
        assert!(endpoint
            .connect("ws://127.0.0.1:1/", NullHandler, config)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn listen_secure_requires_identity() {
        let endpoint = Endpoint::new();
        let err = endpoint
            .listen_secure(0, NullHandler, ConnectionConfig::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("server identity not configured"));
    }
}
