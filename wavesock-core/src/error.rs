//! Error types for Wavesock
//!
//! This module defines all error types used throughout the Wavesock crates.
//! The reader loop stores its terminating error in the connection status as
//! an `Arc<Error>` so status snapshots can carry it.

use std::sync::Arc;
use thiserror::Error;

/// Result type alias for Wavesock operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Wavesock operations
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket protocol violation detected on the wire
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// Opening handshake failed
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Configuration rejected by validation
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error on the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS setup or negotiation failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Inbound message exceeded the configured aggregate limit
    #[error("message too big: {size} bytes (max {max})")]
    MessageTooBig {
        /// Aggregate size observed so far
        size: u64,
        /// Configured limit
        max: u64,
    },

    /// The connection closed while a message was still being read
    #[error("message truncated by connection closure")]
    MessageTruncated,

    /// Send attempted on a connection that is not open
    #[error("connection is closed")]
    ConnectionClosed,

    /// A blocking read exceeded its deadline
    #[error("read timed out after {0:?}")]
    ReadTimeout(std::time::Duration),

    /// The socket was torn down out-of-band by the close grace timer
    #[error("connection close was forced")]
    ForcedClose,

    /// Invalid UTF-8 in a text message
    #[error("invalid UTF-8 in text message")]
    InvalidUtf8,

    /// An error already captured into a connection status record
    #[error("{0}")]
    Shared(Arc<Error>),
}

/// WebSocket framing and control-protocol violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// One of RSV1/RSV2/RSV3 was set; extensions are not negotiated
    #[error("reserved bits set in frame header")]
    ReservedBits,

    /// Opcode outside the set defined by the protocol
    #[error("unexpected opcode {0:#x}")]
    UnexpectedOpcode(u8),

    /// CONTINUATION frame without a data message in progress
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    /// New TEXT/BINARY frame while a fragmented message is in progress
    #[error("data frame while another message is in progress")]
    MessageInProgress,

    /// Control frame with the FIN bit clear
    #[error("fragmented control frame")]
    FragmentedControlFrame,

    /// Control frame payload above the 125-byte cap
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooBig(u64),

    /// Masked frame from a server, or unmasked frame from a client
    #[error("frame mask direction mismatch")]
    MaskMismatch,

    /// PONG with no ping outstanding or with a foreign payload
    #[error("unexpected pong")]
    UnexpectedPong,
}

/// Opening-handshake failures, both roles
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Start line did not parse
    #[error("malformed start line: {0:?}")]
    MalformedStartLine(String),

    /// Header line did not parse
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    /// A head line exceeded the permitted length
    #[error("header line exceeds {max} bytes")]
    HeadTooLarge {
        /// Permitted line length
        max: usize,
    },

    /// HTTP method other than GET on the upgrade request
    #[error("unexpected method {0:?}")]
    UnexpectedMethod(String),

    /// Required header absent
    #[error("missing required header {0}")]
    MissingHeader(&'static str),

    /// Header present but with an unusable value
    #[error("invalid value for header {header}: {value:?}")]
    InvalidHeader {
        /// Header name
        header: &'static str,
        /// Received value
        value: String,
    },

    /// Response status other than 101
    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(u16),

    /// Sec-WebSocket-Accept did not match the expected digest
    #[error("accept key mismatch: expected {expected}, received {received}")]
    AcceptMismatch {
        /// Digest computed from the sent key
        expected: String,
        /// Digest the peer returned
        received: String,
    },

    /// Subprotocol negotiation produced no agreed value
    #[error("no agreed subprotocol")]
    SubprotocolMismatch,
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field failed validation
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// URI could not be used to open a connection
    #[error("invalid URI: {0}")]
    InvalidUri(String),
}

impl Error {
    /// True when the error is the wire-level end of stream
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = Error::Protocol(ProtocolError::UnexpectedOpcode(0x3));
        assert_eq!(err.to_string(), "protocol violation: unexpected opcode 0x3");

        let err = Error::MessageTooBig { size: 2000, max: 1000 };
        assert_eq!(err.to_string(), "message too big: 2000 bytes (max 1000)");
    }

    #[test]
    fn shared_error_displays_inner() {
        let inner = Arc::new(Error::ConnectionClosed);
        assert_eq!(Error::Shared(inner).to_string(), "connection is closed");
    }

    #[test]
    fn eof_detection() {
        let eof = Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "unexpected EOF (header)",
        ));
        assert!(eof.is_eof());
        assert!(!Error::ConnectionClosed.is_eof());
    }
}
