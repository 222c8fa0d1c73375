//! Signaling configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Default interval between server heartbeats
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default client-side connect deadline
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Server-side relay configuration
#[derive(Debug, Clone)]
pub struct SignalingServerConfig {
    /// Address the relay listens on
    pub bind_addr: SocketAddr,
    /// Room capacity; joins past this fail
    pub max_participants_per_session: usize,
    /// Interval between server heartbeats. A socket with no traffic for
    /// twice this interval is considered dead and closed.
    pub heartbeat_interval: Duration,
    /// Protocol errors tolerated per socket before it is closed
    pub max_protocol_errors: u32,
}

impl Default for SignalingServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9300)),
            max_participants_per_session: 50,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_protocol_errors: 3,
        }
    }
}

/// Client-side signaling configuration, embedded in a session's
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingConfig {
    /// Whether server-mediated signaling is used at all
    pub enable_signaling: bool,
    /// Relay URL, e.g. `ws://127.0.0.1:9300`
    pub server_url: String,
    /// Fall back to direct event-bus emission when the relay cannot be
    /// reached within `connect_timeout`
    pub fallback_to_direct: bool,
    /// How long a connection attempt may take before it counts as
    /// unreachable. Deliberately configurable: "slow" and "down" are
    /// distinguished only by this deadline.
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
    /// Interval between client heartbeats, keeping the socket out of the
    /// server's idle reaper
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            enable_signaling: true,
            server_url: "ws://127.0.0.1:9300".to_string(),
            fallback_to_direct: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signaling_config_serializes_durations_as_millis() {
        let config = SignalingConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["connectTimeout"], 5000);
        assert_eq!(json["enableSignaling"], true);

        let back: SignalingConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.connect_timeout, Duration::from_secs(5));
    }
}
