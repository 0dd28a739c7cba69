//! Handler seams exposed to applications
//!
//! A [`ConnectionHandler`] receives the life-cycle events of one
//! connection, strictly in order: `on_open`, one `on_message` per inbound
//! message, at most one `on_error`, then `on_close` exactly once. An
//! [`AcceptorHandler`] observes a listening acceptor and may veto
//! individual connections. Handlers must be re-entrant across
//! connections; per connection they are called sequentially.

use crate::acceptor::Acceptor;
use crate::connection::Connection;
use crate::reader::MessageReader;
use async_trait::async_trait;
use wavesock_core::{CloseStatus, Error};

/// Event handler for a single connection
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// The opening handshake completed; the connection is usable
    async fn on_open(&self, _conn: &Connection, _subprotocol: Option<&str>) {}

    /// One inbound message is ready to be streamed. Unread bytes are
    /// discarded when the handler returns.
    async fn on_message(&self, _conn: &Connection, _message: &mut MessageReader<'_>, _is_text: bool) {
    }

    /// A non-EOF error terminated the connection; fired at most once,
    /// before `on_close`
    async fn on_error(&self, _conn: &Connection, _error: &Error) {}

    /// The connection is finished; fired exactly once, last
    async fn on_close(&self, _conn: &Connection, _status: CloseStatus) {}
}

/// Event handler for an acceptor
#[async_trait]
pub trait AcceptorHandler: Send + Sync + 'static {
    /// The accept loop is about to start
    async fn on_start(&self, _acceptor: &Acceptor) {}

    /// A socket was accepted; return false to drop it without starting
    /// the connection
    async fn on_accept(&self, _acceptor: &Acceptor, _conn: &Connection) -> bool {
        true
    }

    /// The accept loop ended; `error` is None after a clean `close`
    async fn on_stop(&self, _acceptor: &Acceptor, error: Option<&Error>) {
        if let Some(error) = error {
            tracing::error!(%error, "acceptor stopped");
        }
    }
}

/// Acceptor handler that admits every connection
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAcceptorHandler;

#[async_trait]
impl AcceptorHandler for DefaultAcceptorHandler {}
