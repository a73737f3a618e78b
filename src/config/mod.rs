//! Typed proxy configuration. The provider blobs parse into these
//! structs at load time; unknown keys are rejected.

pub mod provider;

pub use provider::{ConfigProvider, FileConfigProvider};

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};
use crate::rule::ShardingRule;

/// Stable identifiers for the provider's documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    ShardingRule,
    DataSources,
    Users,
    Listeners,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 4] = [
        ConfigKey::ShardingRule,
        ConfigKey::DataSources,
        ConfigKey::Users,
        ConfigKey::Listeners,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::ShardingRule => "shardingRule",
            ConfigKey::DataSources => "dataSources",
            ConfigKey::Users => "users",
            ConfigKey::Listeners => "listeners",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    #[serde(default = "default_listen_host")]
    pub host: String,
    pub port: u16,
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataSourceConfig {
    /// Symbolic name statements route by; by convention the backend
    /// database name.
    pub name: String,
    /// `user:password@net(addr)/dbname` form.
    pub dsn: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_max_connections() -> usize {
    16
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
}

/// The whole proxy configuration, assembled from the four provider
/// documents (or one JSON file for simple deployments).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub data_sources: Vec<DataSourceConfig>,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub rule: ShardingRule,
    #[serde(default = "default_server_version")]
    pub server_version: String,
    /// Per-statement deadline; 0 disables it.
    #[serde(default)]
    pub statement_timeout_ms: u64,
}

fn default_server_version() -> String {
    "5.7.99-shard-proxy".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listeners: vec![ListenerConfig {
                host: default_listen_host(),
                port: 13306,
            }],
            data_sources: Vec::new(),
            users: Vec::new(),
            rule: ShardingRule::default(),
            server_version: default_server_version(),
            statement_timeout_ms: 0,
        }
    }
}

impl ProxyConfig {
    /// Statements on tables outside the rule go to the first configured
    /// data source.
    pub fn default_data_source(&self) -> Result<&str> {
        self.data_sources
            .first()
            .map(|ds| ds.name.as_str())
            .ok_or_else(|| ProxyError::Config("no data sources configured".to_string()))
    }

    pub fn from_json(data: &[u8]) -> Result<ProxyConfig> {
        serde_json::from_slice(data)
            .map_err(|e| ProxyError::Config(format!("malformed proxy config: {}", e)))
    }

    /// Assembles the config from the provider's four documents. Missing
    /// documents fall back to their defaults.
    pub async fn load(provider: &dyn ConfigProvider) -> Result<ProxyConfig> {
        let mut config = ProxyConfig::default();

        if let Ok(data) = provider.get(ConfigKey::Listeners).await {
            config.listeners = serde_json::from_slice(&data)
                .map_err(|e| ProxyError::Config(format!("malformed listeners: {}", e)))?;
        }
        if let Ok(data) = provider.get(ConfigKey::DataSources).await {
            config.data_sources = serde_json::from_slice(&data)
                .map_err(|e| ProxyError::Config(format!("malformed dataSources: {}", e)))?;
        }
        if let Ok(data) = provider.get(ConfigKey::Users).await {
            config.users = serde_json::from_slice(&data)
                .map_err(|e| ProxyError::Config(format!("malformed users: {}", e)))?;
        }
        if let Ok(data) = provider.get(ConfigKey::ShardingRule).await {
            config.rule = serde_json::from_slice(&data)
                .map_err(|e| ProxyError::Config(format!("malformed shardingRule: {}", e)))?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = br#"{"listeners": [], "bogus": 1}"#;
        assert!(ProxyConfig::from_json(raw).is_err());
    }

    #[test]
    fn defaults_fill_in() {
        let raw = br#"{
            "data_sources": [
                {"name": "fake_db_0000", "dsn": "root:pw@tcp(10.0.0.1)/fake_db_0000"}
            ]
        }"#;
        let config = ProxyConfig::from_json(raw).unwrap();
        assert_eq!(config.data_sources[0].max_connections, 16);
        assert_eq!(config.default_data_source().unwrap(), "fake_db_0000");
        assert_eq!(config.server_version, "5.7.99-shard-proxy");
    }

    #[test]
    fn rule_round_trips_through_json() {
        use crate::rule::{ShardAlgorithm, TableRule};
        let config = ProxyConfig {
            rule: ShardingRule {
                tables: vec![TableRule {
                    logical_table: "student".to_string(),
                    shard_column: "uid".to_string(),
                    algorithm: ShardAlgorithm::Modulo { shards: 8 },
                    db_pattern: "fake_db_${0000}".to_string(),
                    table_pattern: "student".to_string(),
                    allow_full_scan: false,
                }],
            },
            ..Default::default()
        };
        let encoded = serde_json::to_vec(&config).unwrap();
        let decoded = ProxyConfig::from_json(&encoded).unwrap();
        assert_eq!(decoded.rule.tables.len(), 1);
        assert_eq!(
            decoded.rule.tables[0].algorithm,
            ShardAlgorithm::Modulo { shards: 8 }
        );
    }

    #[test]
    fn missing_data_sources_is_an_error_at_use() {
        let config = ProxyConfig::default();
        assert!(config.default_data_source().is_err());
    }
}
