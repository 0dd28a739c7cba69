//! TLS transport for the Wavesock WebSocket library
//!
//! rustls-based [`Listener`] implementation and client connector for
//! `wss://` endpoints, plus PEM loading of server identity and client
//! trust material.
//!
//! [`Listener`]: wavesock_core::Listener

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

mod tls;

pub use tls::{client_config, connect, server_config, ClientTrust, ServerIdentity, TlsTransport};

/// Prelude for the TLS transport
pub mod prelude {
    pub use crate::{ClientTrust, ServerIdentity, TlsTransport};
}
