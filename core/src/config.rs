//! Network configuration
//!
//! Plain serde structs with defaults. Timings are stored in milliseconds so the
//! structs round-trip through JSON config files unchanged.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// ICE server configuration handed to the WebRTC transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Reliable signaling timings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Interval between resends of an unacknowledged signal
    pub retry_interval_ms: u64,
    /// Time after which an unacknowledged signal is given up
    pub retry_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 300,
            retry_timeout_ms: 3000,
        }
    }
}

impl RouterConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }
}

/// Signaling server link timings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalClientConfig {
    /// Timeout for join/leave/lookup requests
    pub rpc_timeout_ms: u64,
    /// First reconnect delay; doubles on each consecutive failure
    pub reconnect_base_ms: u64,
    /// Upper bound for the reconnect delay
    pub reconnect_max_ms: u64,
    /// Delay before re-running topic reconciliation after a failure
    pub reconcile_retry_ms: u64,
}

impl Default for SignalClientConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: 3000,
            reconnect_base_ms: 100,
            reconnect_max_ms: 5000,
            reconcile_retry_ms: 3000,
        }
    }
}

impl SignalClientConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn reconcile_retry(&self) -> Duration {
        Duration::from_millis(self.reconcile_retry_ms)
    }
}

/// All timing knobs of the networking stack
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub router: RouterConfig,
    pub signal: SignalClientConfig,
    /// Upper bound for an offer to be answered
    pub offer_timeout_ms: u64,
    /// Upper bound for a transport to connect once the offer was answered
    pub connect_timeout_ms: u64,
    /// Artificial per-message delay of the in-memory transport
    pub memory_transport_delay_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            signal: SignalClientConfig::default(),
            offer_timeout_ms: 10_000,
            connect_timeout_ms: 15_000,
            memory_transport_delay_ms: 10,
        }
    }
}

impl NetworkConfig {
    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn memory_transport_delay(&self) -> Duration {
        Duration::from_millis(self.memory_transport_delay_ms)
    }
}

/// Options accepted by `NetworkManager::new`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkManagerOptions {
    /// Signaling server websocket URLs
    pub signal: Vec<String>,
    /// ICE servers for WebRTC connections
    pub ice: Vec<IceServerConfig>,
    /// Install a tracing subscriber and keep the devtools event history
    pub log: bool,
    pub timing: NetworkConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.router.retry_interval(), Duration::from_millis(300));
        assert_eq!(config.router.retry_timeout(), Duration::from_secs(3));
        assert_eq!(config.signal.rpc_timeout(), Duration::from_secs(3));
        assert_eq!(config.signal.reconcile_retry(), Duration::from_secs(3));
        assert_eq!(config.offer_timeout(), Duration::from_secs(10));
        assert_eq!(config.connect_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_options_from_partial_json() {
        let json = r#"{
            "signal": ["ws://localhost:4000"],
            "ice": [{ "urls": ["stun:stun.l.google.com:19302"] }],
            "timing": { "router": { "retry_interval_ms": 50 } }
        }"#;
        let options: NetworkManagerOptions = serde_json::from_str(json).unwrap();
        assert_eq!(options.signal, vec!["ws://localhost:4000".to_string()]);
        assert_eq!(options.ice[0].username, None);
        assert!(!options.log);
        assert_eq!(options.timing.router.retry_interval_ms, 50);
        assert_eq!(options.timing.router.retry_timeout_ms, 3000);
    }
}
