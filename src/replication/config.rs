//! Replication Configuration
//!
//! Tuning knobs for one ring member: where it listens, whom it joins and how
//! aggressively its background loops run.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one store node.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Human-readable identifier used in logs (e.g., "store-1")
    pub node_id: String,

    /// Address to bind the QUIC endpoint (default: 0.0.0.0:4100)
    pub listen_addr: SocketAddr,

    /// Address peers should dial; defaults to the bound address
    pub broadcast_addr: Option<String>,

    /// Existing member to join on startup
    pub join_addr: Option<String>,

    /// Replicas per key (default: 3)
    pub redundancy: usize,

    /// Interval between notify/ping rounds (default: 1s)
    pub ping_interval: Duration,

    /// Interval between sync, clean and migrate rounds (default: 1s)
    pub sync_interval: Duration,

    /// Owned-count ratio to the successor that triggers a migration (default: 1.5)
    pub migrate_hysteresis: f64,

    /// Quiet period before migrating, in sync intervals (default: 2)
    pub migrate_wait_factor: u32,

    /// Owned entries below which a node never migrates (default: 10)
    pub migrate_floor: usize,

    /// Attempts before routing gives up on a key (default: 5)
    pub max_route_attempts: usize,

    /// First backoff between routing attempts, doubled each time (default: 50ms)
    pub retry_backoff: Duration,

    /// SQLite operation log; in-memory only when absent
    pub log_path: Option<PathBuf>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 4100)),
            broadcast_addr: None,
            join_addr: None,
            redundancy: 3,
            ping_interval: Duration::from_secs(1),
            sync_interval: Duration::from_secs(1),
            migrate_hysteresis: 1.5,
            migrate_wait_factor: 2,
            migrate_floor: 10,
            max_route_attempts: 5,
            retry_backoff: Duration::from_millis(50),
            log_path: None,
        }
    }
}

impl ReplicationConfig {
    /// Create a new configuration with node ID.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn broadcast_addr(mut self, addr: impl Into<String>) -> Self {
        self.broadcast_addr = Some(addr.into());
        self
    }

    pub fn join_addr(mut self, addr: impl Into<String>) -> Self {
        self.join_addr = Some(addr.into());
        self
    }

    pub fn redundancy(mut self, redundancy: usize) -> Self {
        self.redundancy = redundancy;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn migrate_hysteresis(mut self, hysteresis: f64) -> Self {
        self.migrate_hysteresis = hysteresis;
        self
    }

    pub fn migrate_wait_factor(mut self, factor: u32) -> Self {
        self.migrate_wait_factor = factor;
        self
    }

    pub fn migrate_floor(mut self, floor: usize) -> Self {
        self.migrate_floor = floor;
        self
    }

    pub fn max_route_attempts(mut self, attempts: usize) -> Self {
        self.max_route_attempts = attempts;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Persist mutations to a SQLite operation log at `path`.
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::MissingNodeId);
        }
        if self.redundancy == 0 {
            return Err(ConfigError::ZeroRedundancy);
        }
        if self.max_route_attempts == 0 {
            return Err(ConfigError::ZeroRouteAttempts);
        }
        if self.migrate_hysteresis.is_nan() || self.migrate_hysteresis < 1.0 {
            return Err(ConfigError::Hysteresis(self.migrate_hysteresis));
        }
        if self.ping_interval.is_zero() || self.sync_interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("node_id is required")]
    MissingNodeId,
    #[error("redundancy must be at least 1")]
    ZeroRedundancy,
    #[error("max_route_attempts must be at least 1")]
    ZeroRouteAttempts,
    #[error("migrate_hysteresis must be at least 1.0, got {0}")]
    Hysteresis(f64),
    #[error("ping and sync intervals must be non-zero")]
    ZeroInterval,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReplicationConfig::default();
        assert!(config.node_id.is_empty());
        assert_eq!(config.listen_addr.port(), 4100);
        assert_eq!(config.redundancy, 3);
        assert_eq!(config.migrate_hysteresis, 1.5);
        assert_eq!(config.migrate_floor, 10);
        assert!(config.log_path.is_none());
    }

    #[test]
    fn test_builder_pattern() {
        let config = ReplicationConfig::new("store-1")
            .listen_addr("127.0.0.1:5001".parse().unwrap())
            .join_addr("127.0.0.1:5000")
            .redundancy(2)
            .sync_interval(Duration::from_millis(100))
            .log_path("/tmp/store.db");

        assert_eq!(config.node_id, "store-1");
        assert_eq!(config.listen_addr.port(), 5001);
        assert_eq!(config.join_addr.as_deref(), Some("127.0.0.1:5000"));
        assert_eq!(config.redundancy, 2);
        assert_eq!(config.sync_interval, Duration::from_millis(100));
        assert_eq!(config.log_path, Some(PathBuf::from("/tmp/store.db")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_missing_node_id() {
        let config = ReplicationConfig::default();
        assert_eq!(config.validate(), Err(ConfigError::MissingNodeId));
    }

    #[test]
    fn test_validate_rejects_zero_redundancy() {
        let config = ReplicationConfig::new("n").redundancy(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroRedundancy));
    }

    #[test]
    fn test_validate_rejects_low_hysteresis() {
        let config = ReplicationConfig::new("n").migrate_hysteresis(0.5);
        assert_eq!(config.validate(), Err(ConfigError::Hysteresis(0.5)));
        let config = ReplicationConfig::new("n").migrate_hysteresis(f64::NAN);
        assert!(config.validate().is_err());
    }
}
