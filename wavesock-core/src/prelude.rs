//! Prelude for Wavesock Core
//!
//! Re-exports the types most callers need.

pub use crate::config::ConnectionConfig;
pub use crate::error::{ConfigError, Error, HandshakeError, ProtocolError, Result};
pub use crate::frame::FrameHeader;
pub use crate::http::{Headers, RequestHead, ResponseHead};
pub use crate::protocol::Opcode;
pub use crate::status::{close_code, CloseStatus};
pub use crate::stream::{BoxStream, Listener, SocketStream};

// Commonly used external types
pub use bytes::{Bytes, BytesMut};
pub use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
