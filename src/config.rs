//! Configuration management.
//!
//! TOML configuration file with sensible defaults and environment
//! variable overrides (`MESHCACHE_*`).

use crate::registry::RedisRegistryConfig;
use crate::ring::RingConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Node identity and listen addresses
    #[serde(default)]
    pub node: NodeConfig,

    /// Consistent-hash ring tuning
    #[serde(default)]
    pub ring: RingSettings,

    /// Coordination-store settings
    #[serde(default)]
    pub registry: RegistrySettings,

    /// Gateway settings
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Monitoring and observability
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Cache groups created at startup
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

/// Node configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    /// RPC listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Address advertised to peers; defaults to the listen address
    #[serde(default)]
    pub advertise_addr: String,

    /// Service name used in the registry keyspace
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

/// Ring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RingSettings {
    /// Virtual nodes per physical node
    #[serde(default = "default_replicas")]
    pub replicas: usize,

    /// Lower clamp for adaptive replica counts
    #[serde(default = "default_min_replicas")]
    pub min_replicas: usize,

    /// Upper clamp for adaptive replica counts
    #[serde(default = "default_max_replicas")]
    pub max_replicas: usize,

    /// Relative load deviation that triggers a rebalance
    #[serde(default = "default_imbalance_threshold")]
    pub imbalance_threshold: f64,
}

/// Registry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistrySettings {
    /// Coordination store URL
    #[serde(default = "default_registry_url")]
    pub url: String,

    /// Lease TTL in seconds
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
}

/// Gateway configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewaySettings {
    /// Serve the external HTTP gateway from this node
    #[serde(default)]
    pub enabled: bool,

    /// Gateway listen address
    #[serde(default = "default_gateway_addr")]
    pub listen_addr: String,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Serve prometheus metrics on /metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

/// One cache group created at startup
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupConfig {
    /// Group name
    pub name: String,

    /// Local store capacity in bytes (0 disables the cap)
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: usize,

    /// Seed data served by the group's data source
    #[serde(default)]
    pub seed: HashMap<String, String>,
}

// Default value functions
fn default_listen_addr() -> String {
    "127.0.0.1:7000".to_string()
}
fn default_service_name() -> String {
    "meshcache".to_string()
}
fn default_replicas() -> usize {
    50
}
fn default_min_replicas() -> usize {
    10
}
fn default_max_replicas() -> usize {
    200
}
fn default_imbalance_threshold() -> f64 {
    0.25
}
fn default_registry_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_lease_ttl() -> u64 {
    10
}
fn default_connection_timeout() -> u64 {
    5
}
fn default_gateway_addr() -> String {
    "127.0.0.1:9000".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_capacity_bytes() -> usize {
    1 << 20
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            ring: RingSettings::default(),
            registry: RegistrySettings::default(),
            gateway: GatewaySettings::default(),
            monitoring: MonitoringConfig::default(),
            groups: Vec::new(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            advertise_addr: String::new(),
            service_name: default_service_name(),
        }
    }
}

impl Default for RingSettings {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            min_replicas: default_min_replicas(),
            max_replicas: default_max_replicas(),
            imbalance_threshold: default_imbalance_threshold(),
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            url: default_registry_url(),
            lease_ttl_secs: default_lease_ttl(),
            connection_timeout_secs: default_connection_timeout(),
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_gateway_addr(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            metrics_enabled: true,
        }
    }
}

impl NodeConfig {
    /// The address this node advertises to its peers.
    pub fn advertise_addr(&self) -> &str {
        if self.advertise_addr.is_empty() {
            &self.listen_addr
        } else {
            &self.advertise_addr
        }
    }
}

impl RingSettings {
    /// Convert into the ring's runtime configuration (default hash).
    pub fn to_ring_config(&self) -> RingConfig {
        RingConfig {
            replicas: self.replicas,
            min_replicas: self.min_replicas,
            max_replicas: self.max_replicas,
            imbalance_threshold: self.imbalance_threshold,
            ..RingConfig::default()
        }
    }
}

impl RegistrySettings {
    /// Convert into the redis registry's runtime configuration.
    pub fn to_registry_config(&self) -> RedisRegistryConfig {
        RedisRegistryConfig {
            url: self.url.clone(),
            lease_ttl_secs: self.lease_ttl_secs,
            connection_timeout: Duration::from_secs(self.connection_timeout_secs),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;

        toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file {}: {}", path, e))
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> Result<Self, String> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("MESHCACHE_LISTEN_ADDR") {
            self.node.listen_addr = addr;
        }
        if let Ok(addr) = std::env::var("MESHCACHE_ADVERTISE_ADDR") {
            self.node.advertise_addr = addr;
        }
        if let Ok(service) = std::env::var("MESHCACHE_SERVICE") {
            self.node.service_name = service;
        }
        if let Ok(url) = std::env::var("MESHCACHE_REGISTRY_URL") {
            self.registry.url = url;
        }
        if let Ok(addr) = std::env::var("MESHCACHE_GATEWAY_ADDR") {
            self.gateway.listen_addr = addr;
            self.gateway.enabled = true;
        }
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.monitoring.log_level = log_level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.node.listen_addr.is_empty() {
            return Err("Listen address cannot be empty".to_string());
        }
        if self.node.service_name.is_empty() {
            return Err("Service name cannot be empty".to_string());
        }

        if self.ring.min_replicas == 0 {
            return Err("min_replicas must be > 0".to_string());
        }
        if self.ring.min_replicas > self.ring.max_replicas {
            return Err("min_replicas cannot exceed max_replicas".to_string());
        }
        if self.ring.replicas < self.ring.min_replicas
            || self.ring.replicas > self.ring.max_replicas
        {
            return Err("replicas must lie within [min_replicas, max_replicas]".to_string());
        }
        if self.ring.imbalance_threshold <= 0.0 {
            return Err("imbalance_threshold must be positive".to_string());
        }

        if self.registry.lease_ttl_secs == 0 {
            return Err("lease_ttl_secs must be > 0".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for group in &self.groups {
            if group.name.is_empty() {
                return Err("Group name cannot be empty".to_string());
            }
            if !seen.insert(group.name.as_str()) {
                return Err(format!("Duplicate group name: {}", group.name));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.listen_addr, "127.0.0.1:7000");
        assert_eq!(config.node.service_name, "meshcache");
        assert_eq!(config.ring.replicas, 50);
        assert!(config.monitoring.metrics_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_advertise_defaults_to_listen() {
        let mut config = Config::default();
        assert_eq!(config.node.advertise_addr(), "127.0.0.1:7000");
        config.node.advertise_addr = "10.0.0.5:7000".to_string();
        assert_eq!(config.node.advertise_addr(), "10.0.0.5:7000");
    }

    #[test]
    fn test_invalid_ring_bounds() {
        let mut config = Config::default();
        config.ring.min_replicas = 100;
        config.ring.max_replicas = 50;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ring.replicas = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_group_names_rejected() {
        let mut config = Config::default();
        config.groups.push(GroupConfig {
            name: "scores".to_string(),
            capacity_bytes: 1024,
            seed: HashMap::new(),
        });
        config.groups.push(GroupConfig {
            name: "scores".to_string(),
            capacity_bytes: 2048,
            seed: HashMap::new(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [node]
            listen_addr = "0.0.0.0:7001"
            service_name = "cachemesh"

            [ring]
            replicas = 64

            [[groups]]
            name = "scores"
            capacity_bytes = 4096

            [groups.seed]
            Tom = "400"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.node.listen_addr, "0.0.0.0:7001");
        assert_eq!(config.ring.replicas, 64);
        assert_eq!(config.groups.len(), 1);
        assert_eq!(config.groups[0].seed["Tom"], "400");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("MESHCACHE_LISTEN_ADDR", "127.0.0.1:9999");
        let config = Config::from_env();
        assert_eq!(config.node.listen_addr, "127.0.0.1:9999");
        std::env::remove_var("MESHCACHE_LISTEN_ADDR");
    }
}
