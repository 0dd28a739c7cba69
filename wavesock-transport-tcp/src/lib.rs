//! TCP transport for the Wavesock WebSocket library
//!
//! Provides the plain-socket [`Listener`] implementation and the client
//! connector used for `ws://` endpoints.
//!
//! [`Listener`]: wavesock_core::Listener

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

mod tcp;

pub use tcp::{connect, connect_host, resolve, TcpTransport};

/// Prelude for the TCP transport
pub mod prelude {
    pub use crate::TcpTransport;
}
