//! Socket stream and listener abstractions
//!
//! One boxed stream type serves plain TCP and TLS so the connection can
//! split it into a buffered read half and a lock-guarded write half. The
//! [`Listener`] trait is the seam the acceptor drives; each transport
//! crate provides an implementation.

use crate::error::Result;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// Object-safe stream over any transport
pub trait SocketStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SocketStream for T {}

/// Boxed transport stream
pub type BoxStream = Box<dyn SocketStream>;

/// Listening socket abstraction the acceptor drives
#[async_trait::async_trait]
pub trait Listener: Send + Sync {
    /// Accept one connection, returning the stream and the peer address
    async fn accept(&self) -> Result<(BoxStream, SocketAddr)>;

    /// Local address the listener is bound to
    fn local_addr(&self) -> Result<SocketAddr>;
}
