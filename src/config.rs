//! Global configuration
//!
//! Loaded once at startup from a TOML file. The three timeout classes in the
//! system (routing cache TTL, lifecycle token expiry, liveness probe bound)
//! are independently configurable.

use crate::token::TokenTtls;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub edge: EdgeConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub directory: DirectoryConfig,

    #[serde(default)]
    pub tokens: TokenConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub pool: PoolSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the public edge listener (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Public edge port (default: 8080)
    #[serde(default = "default_edge_port")]
    pub edge_port: u16,

    /// Bind address for the orchestrator listener. Containers report
    /// lifecycle progress over the network, so this must be reachable from
    /// the cluster (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub orchestrator_bind: String,

    /// Orchestrator port; receives container webhooks and edge-internal
    /// calls (default: 8091)
    #[serde(default = "default_orchestrator_port")]
    pub orchestrator_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            edge_port: default_edge_port(),
            orchestrator_bind: default_bind_address(),
            orchestrator_port: default_orchestrator_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EdgeConfig {
    /// Base URL of the object store serving static projects
    #[serde(default = "default_object_store_base")]
    pub object_store_base: String,

    /// Internal cluster DNS suffix for dynamic projects; the project id is
    /// used as a subdomain under this host
    #[serde(default = "default_dynamic_cluster_host")]
    pub dynamic_cluster_host: String,

    /// Value of the x-served-by header stamped on every response
    #[serde(default = "default_served_by")]
    pub served_by: String,

    /// Liveness probe timeout in milliseconds (default: 2000)
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl EdgeConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            object_store_base: default_object_store_base(),
            dynamic_cluster_host: default_dynamic_cluster_host(),
            served_by: default_served_by(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Routing cache entry TTL in seconds (default: 900)
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    /// Sweep interval for expired entries in seconds (default: 300)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DirectoryConfig {
    /// Base URL of the project-management service
    #[serde(default = "default_directory_base")]
    pub base_url: String,

    /// Lookup timeout in milliseconds (default: 3000)
    #[serde(default = "default_directory_timeout_ms")]
    pub timeout_ms: u64,
}

impl DirectoryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            base_url: default_directory_base(),
            timeout_ms: default_directory_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenConfig {
    /// HMAC secret for lifecycle webhook tokens. A random secret is
    /// generated when unset; set a fixed value so tokens survive restarts.
    pub secret: Option<String>,

    /// Per-action expiry budgets
    #[serde(default)]
    pub ttls: TokenTtls,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: None,
            ttls: TokenTtls::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    /// Approximate maximum length per topic (default: 100)
    #[serde(default = "default_stream_max_len")]
    pub max_len: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_len: default_stream_max_len(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Path to the deployment record database
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolSettings {
    /// Maximum idle connections per upstream host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_idle_per_host: default_pool_max_idle_per_host(),
            idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e)
        })?;
        let config: Config = toml::from_str(&contents).map_err(|e| {
            anyhow::anyhow!("Failed to parse config file {}: {}", path.display(), e)
        })?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            edge: EdgeConfig::default(),
            cache: CacheConfig::default(),
            directory: DirectoryConfig::default(),
            tokens: TokenConfig::default(),
            stream: StreamConfig::default(),
            store: StoreConfig::default(),
            pool: PoolSettings::default(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_edge_port() -> u16 {
    8080
}

fn default_orchestrator_port() -> u16 {
    8091
}

fn default_object_store_base() -> String {
    "http://127.0.0.1:9000".to_string()
}

fn default_dynamic_cluster_host() -> String {
    "apps.internal".to_string()
}

fn default_served_by() -> String {
    "wakegate-edge".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_cache_ttl() -> u64 {
    15 * 60
}

fn default_sweep_interval() -> u64 {
    5 * 60
}

fn default_directory_base() -> String {
    "http://127.0.0.1:8090".to_string()
}

fn default_directory_timeout_ms() -> u64 {
    3000
}

fn default_stream_max_len() -> usize {
    100
}

fn default_store_path() -> String {
    "./data/deployments.db".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.edge_port, 8080);
        // Containers deliver webhooks over the network; the orchestrator
        // listener must not default to loopback
        assert_eq!(config.server.orchestrator_bind, "0.0.0.0");
        assert_eq!(config.server.orchestrator_port, 8091);
        assert_eq!(config.cache.ttl(), Duration::from_secs(900));
        assert_eq!(config.cache.sweep_interval(), Duration::from_secs(300));
        assert_eq!(config.edge.probe_timeout(), Duration::from_millis(2000));
        assert_eq!(config.stream.max_len, 100);
        assert!(config.tokens.secret.is_none());
    }

    #[test]
    fn test_partial_config() {
        let config: Config = toml::from_str(
            r#"
            [server]
            edge_port = 80
            orchestrator_bind = "10.0.0.5"

            [edge]
            object_store_base = "http://storage.internal:9000"
            dynamic_cluster_host = "cluster.svc.local"

            [cache]
            ttl_secs = 60

            [tokens]
            secret = "fixed-secret"

            [tokens.ttls]
            provisioning_secs = 300
            "#,
        )
        .unwrap();

        assert_eq!(config.server.edge_port, 80);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.orchestrator_bind, "10.0.0.5");
        assert_eq!(config.edge.object_store_base, "http://storage.internal:9000");
        assert_eq!(config.edge.dynamic_cluster_host, "cluster.svc.local");
        assert_eq!(config.cache.ttl_secs, 60);
        assert_eq!(config.tokens.secret.as_deref(), Some("fixed-secret"));
        assert_eq!(config.tokens.ttls.provisioning_secs, 300);
        // Unset TTLs keep their defaults
        assert_eq!(config.tokens.ttls.production_secs, 1200);
    }
}
