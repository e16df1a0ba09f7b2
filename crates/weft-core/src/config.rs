//! Session layer configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// MTU advertised in outbound pings.
    ///
    /// The protocol floor is 1280; peers ignore advertised values below it.
    pub interface_mtu: u16,

    /// Idle time after which a session is cancelled by the maintenance sweep
    pub idle_timeout: Duration,

    /// Quiet time after which the maintenance sweep pings a session
    pub ping_interval: Duration,

    /// Minimum interval between index compaction passes
    pub cleanup_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            interface_mtu: 1280,
            idle_timeout: Duration::from_secs(180),
            ping_interval: Duration::from_secs(15),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Crypto worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker threads (`None` = one per CPU)
    pub workers: Option<usize>,

    /// Maximum crypto jobs in flight across all sessions
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: None,
            queue_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.interface_mtu, 1280);
        assert!(config.idle_timeout > config.ping_interval);

        let pool = PoolConfig::default();
        assert_eq!(pool.workers, None);
        assert!(pool.queue_capacity > 0);
    }

    #[test]
    fn test_partial_deserialization() {
        let config: SessionConfig = serde_json::from_str(r#"{"interface_mtu": 9000}"#).unwrap();
        assert_eq!(config.interface_mtu, 9000);
        assert_eq!(config.idle_timeout, SessionConfig::default().idle_timeout);
    }
}
