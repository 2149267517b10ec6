//! Network and authentication settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stream::WireFormat;

/// Settings for a [`NetworkInterface`](crate::interface::NetworkInterface)
/// and its service thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Frame codec.
    pub wire_format: WireFormat,
    /// How long the service thread waits for outbound work before polling
    /// the transport again.
    pub service_poll_interval_ms: u64,
    /// Bound on frames queued for the service thread. `NO_DELAY` packets are
    /// dropped instead of waiting when this is full.
    pub outbound_queue_capacity: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            wire_format: WireFormat::Binary,
            service_poll_interval_ms: 2,
            outbound_queue_capacity: 1024,
        }
    }
}

impl NetConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn service_poll_interval(&self) -> Duration {
        Duration::from_millis(self.service_poll_interval_ms.max(1))
    }
}

/// Settings for the login handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Length in bytes of the random challenge token.
    pub token_len: usize,
    /// Modulus size for generated RSA keys.
    pub rsa_bits: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_len: 32,
            rsa_bits: 2048,
        }
    }
}

impl AuthConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = NetConfig::from_json_str(r#"{"wire_format": "json"}"#).unwrap();
        assert_eq!(cfg.wire_format, WireFormat::Json);
        assert_eq!(cfg.outbound_queue_capacity, 1024);

        let auth = AuthConfig::from_json_str(r#"{"token_len": 16}"#).unwrap();
        assert_eq!(auth.token_len, 16);
        assert_eq!(auth.rsa_bits, 2048);
    }

    #[test]
    fn poll_interval_is_never_zero() {
        let cfg = NetConfig {
            service_poll_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(cfg.service_poll_interval(), Duration::from_millis(1));
    }
}
