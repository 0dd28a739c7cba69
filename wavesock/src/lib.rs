//! # Wavesock
//!
//! WebSocket endpoint library implementing RFC 6455 (protocol version 13)
//! over plain TCP and TLS, usable in both client and server roles, with
//! stream-based messaging.
//!
//! One [`Endpoint`] creates client connections and listening acceptors
//! and owns their registries, so a single [`Endpoint::close_all`] shuts
//! everything down. Events are delivered through a
//! [`ConnectionHandler`]; inbound messages arrive as a lazy
//! [`MessageReader`] spanning frame boundaries.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use wavesock::prelude::*;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl ConnectionHandler for Echo {
//!     async fn on_message(
//!         &self,
//!         conn: &Connection,
//!         message: &mut MessageReader<'_>,
//!         is_text: bool,
//!     ) {
//!         if let Ok(payload) = message.read_to_end().await {
//!             let _ = conn.send(std::io::Cursor::new(payload), is_text).await;
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let endpoint = Endpoint::new();
//!     let acceptor = endpoint
//!         .listen(8080, Echo, ConnectionConfig::default())
//!         .await?;
//!     println!("listening on port {}", acceptor.port());
//!     tokio::signal::ctrl_c().await?;
//!     endpoint.close_all("going down").await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

pub mod acceptor;
pub mod connection;
pub mod endpoint;
pub mod handler;
#[cfg(feature = "logging")]
pub mod logging;
pub mod reader;
mod registry;

pub use acceptor::Acceptor;
pub use connection::Connection;
pub use endpoint::Endpoint;
pub use handler::{AcceptorHandler, ConnectionHandler, DefaultAcceptorHandler};
pub use reader::MessageReader;

// Re-export the protocol types
pub use wavesock_core::{
    close_code, CloseStatus, ConnectionConfig, Error, HandshakeError, ProtocolError, Result,
};
pub use wavesock_transport_tls::{ClientTrust, ServerIdentity};

/// Prelude with the types most applications need
pub mod prelude {
    pub use crate::acceptor::Acceptor;
    pub use crate::connection::Connection;
    pub use crate::endpoint::Endpoint;
    pub use crate::handler::{AcceptorHandler, ConnectionHandler, DefaultAcceptorHandler};
    pub use crate::reader::MessageReader;
    pub use wavesock_core::prelude::*;
    pub use wavesock_transport_tls::prelude::*;
}
