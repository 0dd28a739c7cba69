//! Per-connection configuration
//!
//! Options governing one connection: handshake and read deadlines, the
//! keepalive ping, outbound fragmentation, the inbound message cap and the
//! advertised subprotocols.

use crate::error::{ConfigError, Result};
use std::time::Duration;

/// Smallest permitted outbound payload buffer; keeps any control frame in
/// a single outbound frame.
pub const MIN_PAYLOAD_BUFFER_LEN: usize = 126;

/// Connection options, shared by both roles
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Read deadline during the opening handshake, and the grace period
    /// before a locally initiated close forces the socket shut
    pub handshake_timeout: Duration,
    /// Read deadline during normal operation
    pub read_timeout: Duration,
    /// Emit a keepalive ping instead of aborting when `read_timeout`
    /// expires while the connection is open
    pub ping_enabled: bool,
    /// Outbound fragmentation threshold; also the maximum payload of one
    /// outbound frame
    pub payload_buffer_len: usize,
    /// Upper bound on an inbound reassembled message
    pub max_message_len: u64,
    /// Advertised subprotocols, in preference order
    pub subprotocols: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(300),
            ping_enabled: true,
            payload_buffer_len: 32 * 1024,
            max_message_len: 16 * 1024 * 1024,
            subprotocols: Vec::new(),
        }
    }
}

impl ConnectionConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the handshake deadline and forced-close grace period
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the read deadline during normal operation
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Enable or disable the keepalive ping
    pub fn with_ping(mut self, enabled: bool) -> Self {
        self.ping_enabled = enabled;
        self
    }

    /// Set the outbound fragmentation threshold
    pub fn with_payload_buffer_len(mut self, len: usize) -> Self {
        self.payload_buffer_len = len;
        self
    }

    /// Set the inbound message cap
    pub fn with_max_message_len(mut self, len: u64) -> Self {
        self.max_message_len = len;
        self
    }

    /// Set the advertised subprotocols
    pub fn with_subprotocols<I, S>(mut self, subprotocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = subprotocols.into_iter().map(Into::into).collect();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.payload_buffer_len < MIN_PAYLOAD_BUFFER_LEN {
            return Err(ConfigError::Validation(format!(
                "payload_buffer_len must be at least {} bytes",
                MIN_PAYLOAD_BUFFER_LEN
            ))
            .into());
        }
        if self.max_message_len == 0 {
            return Err(
                ConfigError::Validation("max_message_len must be greater than 0".to_string())
                    .into(),
            );
        }
        if self.handshake_timeout.is_zero() || self.read_timeout.is_zero() {
            return Err(
                ConfigError::Validation("timeouts must be greater than 0".to_string()).into(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ConnectionConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.ping_enabled);
        assert!(config.subprotocols.is_empty());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let config = ConnectionConfig::default().with_payload_buffer_len(64);
        assert!(config.validate().is_err());

        let config = ConnectionConfig::default().with_max_message_len(0);
        assert!(config.validate().is_err());

        let config = ConnectionConfig::default().with_read_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn setters_chain() {
        let config = ConnectionConfig::new()
            .with_handshake_timeout(Duration::from_secs(2))
            .with_read_timeout(Duration::from_secs(30))
            .with_ping(false)
            .with_subprotocols(["chat", "log"]);
        assert_eq!(config.handshake_timeout, Duration::from_secs(2));
        assert!(!config.ping_enabled);
        assert_eq!(config.subprotocols, vec!["chat", "log"]);
    }
}
