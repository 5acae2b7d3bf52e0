//! Configuration for ClueGetter

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server identity
    #[serde(default)]
    pub server: ServerConfig,

    /// Engine-wide knobs
    #[serde(default)]
    pub cluegetter: EngineConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Greylisting module configuration
    #[serde(default)]
    pub greylisting: GreylistConfig,

    /// Module groups, keyed by group name
    #[serde(default)]
    pub module_group: HashMap<String, ModuleGroupConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Local hostname, used in injected Message-Ids and as the
    /// distributed-lock owner label
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Cluster instance id; keys the relational store and cache entries
    #[serde(default = "default_instance")]
    pub instance: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            instance: default_instance(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_instance() -> i64 {
    1
}

/// Engine-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-action circuit-breaker threshold
    #[serde(default = "default_breaker_score")]
    pub breaker_score: f64,

    /// Reject when the weighted reject total reaches this score
    #[serde(default = "default_reject_score")]
    pub message_reject_score: f64,

    /// Tempfail when the weighted tempfail+reject total reaches this score
    #[serde(default = "default_tempfail_score")]
    pub message_tempfail_score: f64,

    /// Cutoff for the `%{spamFlag}` substitution token
    #[serde(default = "default_spamflag_score")]
    pub message_spamflag_score: f64,

    /// Inject a Message-Id header when the message has none
    #[serde(default)]
    pub insert_missing_message_id: bool,

    /// Header templates to add to each message; a `[U]` prefix marks the
    /// header as unique
    #[serde(default)]
    pub add_header: Vec<String>,

    /// Disable panic recovery; panics take the process down
    #[serde(default)]
    pub exit_on_panic: bool,

    /// Capacity of the archive queue
    #[serde(default = "default_archive_queue_size")]
    pub archive_queue_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            breaker_score: default_breaker_score(),
            message_reject_score: default_reject_score(),
            message_tempfail_score: default_tempfail_score(),
            message_spamflag_score: default_spamflag_score(),
            insert_missing_message_id: false,
            add_header: Vec::new(),
            exit_on_panic: false,
            archive_queue_size: default_archive_queue_size(),
        }
    }
}

fn default_breaker_score() -> f64 {
    100.0
}

fn default_reject_score() -> f64 {
    5.0
}

fn default_tempfail_score() -> f64 {
    8.0
}

fn default_spamflag_score() -> f64 {
    4.5
}

fn default_archive_queue_size() -> usize {
    100
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

fn default_database_url() -> String {
    "postgres://cluegetter@localhost/cluegetter".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

/// Redis configuration; when disabled the greylisting module falls back
/// to its relational backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_string()
}

/// Greylisting module configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreylistConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Minutes a new sender tuple is tempfailed before being permitted
    #[serde(default = "default_initial_period")]
    pub initial_period: u64,

    /// Score returned while the initial period is in effect
    #[serde(default = "default_initial_score")]
    pub initial_score: f64,

    /// Domains whose SPF records short-circuit greylisting
    #[serde(default)]
    pub whitelist_spf: Vec<String>,
}

impl Default for GreylistConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_period: default_initial_period(),
            initial_score: default_initial_score(),
            whitelist_spf: Vec::new(),
        }
    }
}

fn default_initial_period() -> u64 {
    5
}

fn default_initial_score() -> f64 {
    4.5
}

/// A module group; members are `"<weight> <module>"` entries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleGroupConfig {
    #[serde(default)]
    pub module: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load() -> crate::Result<Self> {
        let paths = [
            std::path::PathBuf::from("./cluegetter.toml"),
            std::path::PathBuf::from("/etc/cluegetter/cluegetter.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.instance, 1);
        assert_eq!(config.cluegetter.breaker_score, 100.0);
        assert_eq!(config.cluegetter.message_reject_score, 5.0);
        assert!(!config.redis.enabled);
        assert!(!config.greylisting.enabled);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
hostname = "mx1.example.com"
instance = 3

[cluegetter]
breaker_score = 50.0
message_reject_score = 6.0
insert_missing_message_id = true
add_header = ["[U] X-Scan: %{spamFlag}", "X-Client: %{clientIp}"]

[greylisting]
enabled = true
initial_period = 4
initial_score = 6.5
whitelist_spf = ["example.net"]

[redis]
enabled = true
url = "redis://cache.example.com/"

[module_group.policy]
module = ["1 quotas", "3 spamassassin"]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.hostname, "mx1.example.com");
        assert_eq!(config.server.instance, 3);
        assert_eq!(config.cluegetter.breaker_score, 50.0);
        assert!(config.cluegetter.insert_missing_message_id);
        assert_eq!(config.cluegetter.add_header.len(), 2);
        assert!(config.greylisting.enabled);
        assert_eq!(config.greylisting.initial_period, 4);
        assert_eq!(config.greylisting.whitelist_spf, vec!["example.net"]);
        assert!(config.redis.enabled);
        assert_eq!(config.module_group["policy"].module.len(), 2);
    }
}
