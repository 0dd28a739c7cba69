//! TLS transport for Wavesock
//!
//! rustls-based listener and client connector for `wss://` endpoints,
//! plus loading of the process-wide identity and trust material from PEM
//! files.

use async_trait::async_trait;
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use wavesock_core::error::{ConfigError, Error};
use wavesock_core::{BoxStream, Listener, Result};
use wavesock_transport_tcp::TcpTransport;

/// Server identity: PEM certificate chain and private key paths
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    /// PEM file with the certificate chain, leaf first
    pub cert_file: PathBuf,
    /// PEM file with the PKCS#8 or RSA private key
    pub key_file: PathBuf,
}

impl ServerIdentity {
    /// Create an identity from certificate and key paths
    pub fn new(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
        }
    }
}

/// Client trust: an optional PEM CA bundle, falling back to the bundled
/// web PKI roots
#[derive(Debug, Clone, Default)]
pub struct ClientTrust {
    /// PEM file with trusted CA certificates; `None` uses webpki-roots
    pub ca_file: Option<PathBuf>,
}

impl ClientTrust {
    /// Trust the bundled web PKI roots
    pub fn web_pki() -> Self {
        Self::default()
    }

    /// Trust only the CAs in the given PEM bundle
    pub fn ca_file(path: impl Into<PathBuf>) -> Self {
        Self {
            ca_file: Some(path.into()),
        }
    }
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let file = File::open(path).map_err(|e| {
        ConfigError::Validation(format!("failed to open certificate file {path:?}: {e}"))
    })?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).map_err(|e| {
        ConfigError::Validation(format!("failed to parse certificate file {path:?}: {e}"))
    })?;
    if certs.is_empty() {
        return Err(
            ConfigError::Validation(format!("no certificates found in {path:?}")).into(),
        );
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let open = |path: &Path| -> Result<BufReader<File>> {
        let file = File::open(path).map_err(|e| {
            ConfigError::Validation(format!("failed to open private key file {path:?}: {e}"))
        })?;
        Ok(BufReader::new(file))
    };

    let mut reader = open(path)?;
    if let Ok(keys) = rustls_pemfile::pkcs8_private_keys(&mut reader) {
        if let Some(key) = keys.into_iter().next() {
            return Ok(PrivateKey(key));
        }
    }

    let mut reader = open(path)?;
    let keys = rustls_pemfile::rsa_private_keys(&mut reader).map_err(|e| {
        ConfigError::Validation(format!("failed to parse private key file {path:?}: {e}"))
    })?;
    keys.into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| ConfigError::Validation(format!("no private keys found in {path:?}")).into())
}

/// Build a rustls server config from an identity
pub fn server_config(identity: &ServerIdentity) -> Result<ServerConfig> {
    let certs = load_certs(&identity.cert_file)?;
    let key = load_private_key(&identity.key_file)?;
    ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(format!("invalid certificate/key pair: {e}")))
}

/// Build a rustls client config from the trust settings
pub fn client_config(trust: &ClientTrust) -> Result<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    match &trust.ca_file {
        Some(path) => {
            for cert in load_certs(path)? {
                root_store
                    .add(&cert)
                    .map_err(|e| Error::Tls(format!("unusable CA certificate: {e}")))?;
            }
        }
        None => {
            root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
                rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                    ta.subject,
                    ta.spki,
                    ta.name_constraints,
                )
            }));
        }
    }
    Ok(ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

/// Listening TLS transport: a TCP listener wrapped by a rustls acceptor
pub struct TlsTransport {
    tcp: TcpTransport,
    acceptor: TlsAcceptor,
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("tcp", &self.tcp)
            .finish()
    }
}

impl TlsTransport {
    /// Bind to `port` on `bind_addr` and serve the given identity
    pub async fn bind(
        bind_addr: Option<IpAddr>,
        port: u16,
        identity: &ServerIdentity,
    ) -> Result<Self> {
        let config = server_config(identity)?;
        let tcp = TcpTransport::bind(bind_addr, port).await?;
        Ok(Self {
            tcp,
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl Listener for TlsTransport {
    async fn accept(&self) -> Result<(BoxStream, SocketAddr)> {
        let (stream, peer) = self.tcp.accept().await?;
        let tls = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| Error::Tls(format!("TLS accept from {peer} failed: {e}")))?;
        Ok((Box::new(tls), peer))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.tcp.local_addr()
    }
}

/// Connect to `host:port` within `deadline` and run the TLS handshake
/// with `server_name` for SNI and certificate validation. Returns the
/// stream and the peer address reached.
pub async fn connect(
    host: &str,
    port: u16,
    bind_addr: Option<IpAddr>,
    server_name: &str,
    config: Arc<ClientConfig>,
    deadline: Duration,
) -> Result<(BoxStream, SocketAddr)> {
    let domain = ServerName::try_from(server_name)
        .map_err(|e| Error::Tls(format!("invalid server name {server_name:?}: {e}")))?;
    let (tcp, peer) = wavesock_transport_tcp::connect_host(host, port, bind_addr, deadline).await?;
    let connector = TlsConnector::from(config);
    let tls = timeout(deadline, connector.connect(domain, tcp))
        .await
        .map_err(|_| Error::ReadTimeout(deadline))?
        .map_err(|e| Error::Tls(format!("TLS connect to {peer} failed: {e}")))?;
    Ok((Box::new(tls), peer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn self_signed_identity() -> (tempfile::NamedTempFile, tempfile::NamedTempFile, String) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_pem = cert.serialize_pem().unwrap();
        let key_pem = cert.serialize_private_key_pem();

        let mut cert_file = tempfile::NamedTempFile::new().unwrap();
        cert_file.write_all(cert_pem.as_bytes()).unwrap();
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        key_file.write_all(key_pem.as_bytes()).unwrap();
        (cert_file, key_file, cert_pem)
    }

    #[test]
    fn identity_loading_rejects_missing_files() {
        let identity = ServerIdentity::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(server_config(&identity).is_err());
    }

    #[test]
    fn identity_loading_accepts_generated_pem() {
        let (cert_file, key_file, _) = self_signed_identity();
        let identity = ServerIdentity::new(cert_file.path(), key_file.path());
        assert!(server_config(&identity).is_ok());
    }

    #[tokio::test]
    async fn tls_round_trip_with_custom_ca() {
        let (cert_file, key_file, cert_pem) = self_signed_identity();
        let identity = ServerIdentity::new(cert_file.path(), key_file.path());

        let mut ca_file = tempfile::NamedTempFile::new().unwrap();
        ca_file.write_all(cert_pem.as_bytes()).unwrap();

        let transport = TlsTransport::bind(Some("127.0.0.1".parse().unwrap()), 0, &identity)
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = transport.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.flush().await.unwrap();
        });

        let config = Arc::new(client_config(&ClientTrust::ca_file(ca_file.path())).unwrap());
        let (mut client, peer) = connect(
            "127.0.0.1",
            addr.port(),
            None,
            "localhost",
            config,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(peer, addr);
        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server.await.unwrap();
    }
}
