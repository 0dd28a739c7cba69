//! # Wavesock Core
//!
//! Core WebSocket protocol implementation for the Wavesock endpoint
//! library: RFC 6455 framing, the opening handshake, close status
//! bookkeeping, per-connection configuration and the transport seams.
//!
//! This crate holds the protocol logic only; the `wavesock` crate drives
//! it over sockets.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod http;
pub mod protocol;
pub mod status;
pub mod stream;

pub mod prelude;

pub use config::ConnectionConfig;
pub use error::{ConfigError, Error, HandshakeError, ProtocolError, Result};
pub use frame::FrameHeader;
pub use http::{Headers, RequestHead, ResponseHead};
pub use protocol::Opcode;
pub use status::{close_code, CloseStatus};
pub use stream::{BoxStream, Listener, SocketStream};
