use crate::replication::ReplicationConfig;
use anyhow::Context;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // Node identity and addresses
    pub node_id: String,
    pub listen_addr: String,
    pub broadcast_addr: Option<String>,
    pub join_addr: Option<String>,
    pub debug: bool,

    // Replication
    pub redundancy: usize,
    pub ping_interval_ms: u64,
    pub sync_interval_ms: u64,

    // Migration
    pub migrate_hysteresis: f64,
    pub migrate_wait_factor: u32,
    pub migrate_floor: usize,

    // Routing retries
    pub max_route_attempts: usize,
    pub retry_backoff_ms: u64,

    // Persistence
    pub log_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "store".to_string(),
            listen_addr: "0.0.0.0:4100".to_string(),
            broadcast_addr: None,
            join_addr: None,
            debug: false,
            redundancy: 3,
            ping_interval_ms: 1000,
            sync_interval_ms: 1000,
            migrate_hysteresis: 1.5,
            migrate_wait_factor: 2,
            migrate_floor: 10,
            max_route_attempts: 5,
            retry_backoff_ms: 50,
            log_path: None,
        }
    }
}

impl Config {
    /// Turn the flat settings into a node configuration.
    pub fn replication_config(&self) -> anyhow::Result<ReplicationConfig> {
        let listen_addr: SocketAddr = self
            .listen_addr
            .parse()
            .with_context(|| format!("invalid RINGSTORE_LISTEN_ADDR {}", self.listen_addr))?;

        let mut config = ReplicationConfig::new(&self.node_id)
            .listen_addr(listen_addr)
            .redundancy(self.redundancy)
            .ping_interval(Duration::from_millis(self.ping_interval_ms))
            .sync_interval(Duration::from_millis(self.sync_interval_ms))
            .migrate_hysteresis(self.migrate_hysteresis)
            .migrate_wait_factor(self.migrate_wait_factor)
            .migrate_floor(self.migrate_floor)
            .max_route_attempts(self.max_route_attempts)
            .retry_backoff(Duration::from_millis(self.retry_backoff_ms));

        if let Some(addr) = &self.broadcast_addr {
            config = config.broadcast_addr(addr);
        }
        if let Some(addr) = &self.join_addr {
            config = config.join_addr(addr);
        }
        if let Some(path) = &self.log_path {
            config = config.log_path(PathBuf::from(path));
        }

        config.validate()?;
        Ok(config)
    }
}

fn flag(value: Option<String>) -> bool {
    value
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn number<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

pub fn load_config() -> anyhow::Result<Config> {
    load_config_from(|name| std::env::var(name).ok())
}

/// Read `RINGSTORE_*` settings through `lookup`. Unparseable numbers fall
/// back to their defaults.
pub fn load_config_from(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
    let defaults = Config::default();

    let node_id = lookup("RINGSTORE_NODE_ID")
        .unwrap_or_else(|| format!("store-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));

    let listen_addr = lookup("RINGSTORE_LISTEN_ADDR").unwrap_or(defaults.listen_addr);
    let broadcast_addr = lookup("RINGSTORE_BROADCAST_ADDR");
    let join_addr = lookup("RINGSTORE_JOIN_ADDR");
    let debug = lookup("DEBUG").is_some() || flag(lookup("RINGSTORE_DEBUG"));

    let redundancy = number(lookup("RINGSTORE_REDUNDANCY"), defaults.redundancy);
    let ping_interval_ms = number(lookup("RINGSTORE_PING_INTERVAL_MS"), defaults.ping_interval_ms);
    let sync_interval_ms = number(lookup("RINGSTORE_SYNC_INTERVAL_MS"), defaults.sync_interval_ms);

    let migrate_hysteresis = number(lookup("RINGSTORE_MIGRATE_HYSTERESIS"), defaults.migrate_hysteresis);
    let migrate_wait_factor = number(lookup("RINGSTORE_MIGRATE_WAIT_FACTOR"), defaults.migrate_wait_factor);
    let migrate_floor = number(lookup("RINGSTORE_MIGRATE_FLOOR"), defaults.migrate_floor);

    let max_route_attempts = number(lookup("RINGSTORE_MAX_ROUTE_ATTEMPTS"), defaults.max_route_attempts);
    let retry_backoff_ms = number(lookup("RINGSTORE_RETRY_BACKOFF_MS"), defaults.retry_backoff_ms);

    let log_path = lookup("RINGSTORE_LOG_PATH");

    Ok(Config {
        node_id,
        listen_addr,
        broadcast_addr,
        join_addr,
        debug,
        redundancy,
        ping_interval_ms,
        sync_interval_ms,
        migrate_hysteresis,
        migrate_wait_factor,
        migrate_floor,
        max_route_attempts,
        retry_backoff_ms,
        log_path,
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        load_config_from(|name| vars.get(name).cloned()).unwrap()
    }

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.listen_addr, "0.0.0.0:4100");
        assert_eq!(cfg.redundancy, 3);
        assert!(!cfg.debug);
        assert!(cfg.join_addr.is_none());
    }

    #[test]
    fn test_load_config_defaults() {
        let cfg = load(&[]);
        assert!(cfg.node_id.starts_with("store-"));
        assert_eq!(cfg.listen_addr, "0.0.0.0:4100");
        assert_eq!(cfg.sync_interval_ms, 1000);
        assert_eq!(cfg.max_route_attempts, 5);
        assert!(cfg.log_path.is_none());
    }

    #[test]
    fn test_load_config_with_custom_values() {
        let cfg = load(&[
            ("RINGSTORE_NODE_ID", "store-7"),
            ("RINGSTORE_LISTEN_ADDR", "127.0.0.1:9000"),
            ("RINGSTORE_JOIN_ADDR", "127.0.0.1:9001"),
            ("RINGSTORE_REDUNDANCY", "2"),
            ("RINGSTORE_MIGRATE_HYSTERESIS", "2.5"),
            ("RINGSTORE_LOG_PATH", "/tmp/store.db"),
        ]);
        assert_eq!(cfg.node_id, "store-7");
        assert_eq!(cfg.listen_addr, "127.0.0.1:9000");
        assert_eq!(cfg.join_addr.as_deref(), Some("127.0.0.1:9001"));
        assert_eq!(cfg.redundancy, 2);
        assert_eq!(cfg.migrate_hysteresis, 2.5);
        assert_eq!(cfg.log_path.as_deref(), Some("/tmp/store.db"));
    }

    #[test]
    fn test_load_config_with_debug() {
        assert!(load(&[("DEBUG", "1")]).debug);
        assert!(load(&[("RINGSTORE_DEBUG", "true")]).debug);
        assert!(!load(&[("RINGSTORE_DEBUG", "no")]).debug);
    }

    #[test]
    fn test_load_config_parse_error_uses_default() {
        let cfg = load(&[("RINGSTORE_SYNC_INTERVAL_MS", "not_a_number")]);
        assert_eq!(cfg.sync_interval_ms, 1000);
    }

    #[test]
    fn test_replication_config_conversion() {
        let cfg = load(&[
            ("RINGSTORE_NODE_ID", "store-1"),
            ("RINGSTORE_LISTEN_ADDR", "127.0.0.1:4100"),
            ("RINGSTORE_BROADCAST_ADDR", "store-1.internal:4100"),
            ("RINGSTORE_PING_INTERVAL_MS", "250"),
        ]);
        let config = cfg.replication_config().unwrap();
        assert_eq!(config.node_id, "store-1");
        assert_eq!(config.listen_addr.port(), 4100);
        assert_eq!(config.broadcast_addr.as_deref(), Some("store-1.internal:4100"));
        assert_eq!(config.ping_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_replication_config_rejects_bad_values() {
        let cfg = load(&[("RINGSTORE_LISTEN_ADDR", "not an address")]);
        assert!(cfg.replication_config().is_err());

        let cfg = load(&[("RINGSTORE_REDUNDANCY", "0")]);
        assert!(cfg.replication_config().is_err());
    }
}
