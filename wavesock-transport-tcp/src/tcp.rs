//! TCP transport for Wavesock
//!
//! Plain socket listener and client connector. The listener is created
//! with SO_REUSEADDR and no accept deadline; accepted and connected
//! sockets get TCP_NODELAY.

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::timeout;
use wavesock_core::error::Error;
use wavesock_core::{BoxStream, Listener, Result};

/// Listening TCP transport
#[derive(Debug)]
pub struct TcpTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpTransport {
    /// Bind to `port` on `bind_addr` (unspecified address when `None`)
    /// with SO_REUSEADDR set
    pub async fn bind(bind_addr: Option<IpAddr>, port: u16) -> Result<Self> {
        let addr = SocketAddr::new(
            bind_addr.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            port,
        );
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(1024)?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }
}

#[async_trait]
impl Listener for TcpTransport {
    async fn accept(&self) -> Result<(BoxStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), peer))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

/// Connect to `addr` within `deadline`, optionally binding the local side
/// to `bind_addr` first
pub async fn connect(
    addr: SocketAddr,
    bind_addr: Option<IpAddr>,
    deadline: Duration,
) -> Result<BoxStream> {
    let stream = timeout(deadline, open(addr, bind_addr))
        .await
        .map_err(|_| Error::ReadTimeout(deadline))??;
    stream.set_nodelay(true)?;
    Ok(Box::new(stream))
}

/// Connect to `host:port` within `deadline`, trying every resolved
/// address in order. Returns the stream and the peer address reached.
pub async fn connect_host(
    host: &str,
    port: u16,
    bind_addr: Option<IpAddr>,
    deadline: Duration,
) -> Result<(BoxStream, SocketAddr)> {
    let stream = timeout(deadline, open_host(host, port, bind_addr))
        .await
        .map_err(|_| Error::ReadTimeout(deadline))??;
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    Ok((Box::new(stream), peer))
}

async fn open_host(host: &str, port: u16, bind_addr: Option<IpAddr>) -> Result<TcpStream> {
    match bind_addr {
        // tokio walks the resolved address list until one connects
        None => Ok(TcpStream::connect((host, port)).await?),
        Some(_) => {
            let addr = resolve(host, port).await?;
            open(addr, bind_addr).await
        }
    }
}

async fn open(addr: SocketAddr, bind_addr: Option<IpAddr>) -> Result<TcpStream> {
    match bind_addr {
        None => Ok(TcpStream::connect(addr).await?),
        Some(local) => {
            let socket = match local {
                IpAddr::V4(_) => TcpSocket::new_v4()?,
                IpAddr::V6(_) => TcpSocket::new_v6()?,
            };
            socket.set_reuseaddr(true)?;
            socket.bind(SocketAddr::new(local, 0))?;
            Ok(socket.connect(addr).await?)
        }
    }
}

/// Resolve a host name and port to the first usable socket address
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    // literal addresses skip the resolver
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    if let Some(stripped) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        if let Ok(ip) = stripped.parse::<Ipv6Addr>() {
            return Ok(SocketAddr::new(IpAddr::V6(ip), port));
        }
    }
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    addrs.next().ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no address found for {host}"),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn bind_accept_connect_round_trip() {
        let transport = TcpTransport::bind(Some(IpAddr::V4(Ipv4Addr::LOCALHOST)), 0)
            .await
            .unwrap();
        let addr = Listener::local_addr(&transport).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, peer) = transport.accept().await.unwrap();
            assert!(peer.ip().is_loopback());
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.flush().await.unwrap();
        });

        let mut client = connect(addr, None, Duration::from_secs(5)).await.unwrap();
        client.write_all(b"echo").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn resolve_accepts_literals() {
        let addr = resolve("127.0.0.1", 80).await.unwrap();
        assert_eq!(addr, "127.0.0.1:80".parse().unwrap());

        let addr = resolve("::1", 443).await.unwrap();
        assert_eq!(addr.port(), 443);
        assert!(addr.ip().is_loopback());
    }
}
