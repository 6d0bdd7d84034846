//! Broker configuration.
//!
//! Loaded from a TOML file with environment overrides:
//! - env vars with `PLUME__` prefix, `__` as the nesting separator
//!   (`PLUME__SERVER__BIND=0.0.0.0:1884`)
//! - in-file substitution: `${VAR}` or `${VAR:-default}`

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use ::config::{Environment, File, FileFormat};
use serde::Deserialize;

pub const DEFAULT_BIND: &str = "0.0.0.0:1883";
pub const DEFAULT_TLS_BIND: &str = "0.0.0.0:8883";
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MAX_TOPIC_LENGTH: usize = 1024;
pub const DEFAULT_MAX_TOPIC_LEVELS: usize = 32;
pub const DEFAULT_KEEP_ALIVE: u16 = 60;
pub const DEFAULT_MAX_KEEP_ALIVE: u16 = 600;
pub const DEFAULT_OFFLINE_QUEUE: usize = 1000;
pub const DEFAULT_LOCK_SHARDS: usize = 64;
pub const DEFAULT_QUEUE_SIZE: usize = 8192;
pub const DEFAULT_SYS_INTERVAL: u64 = 10;

/// Expand `${VAR}` and `${VAR:-default}` references against the process
/// environment. An unset variable expands to its default, or to the empty
/// string without one. Malformed references (unterminated, empty or
/// colon-bearing names) pass through untouched.
fn expand_env_refs(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let reference = &rest[start..];

        let Some(end) = reference.find('}') else {
            out.push_str(reference);
            rest = "";
            break;
        };

        let spec = &reference[2..end];
        let (name, default) = match spec.split_once(":-") {
            Some((name, default)) => (name, default),
            None => (spec, ""),
        };

        if name.is_empty() || name.contains(':') {
            out.push_str(&reference[..=end]);
        } else {
            match std::env::var(name) {
                Ok(value) => out.push_str(&value),
                Err(_) => out.push_str(default),
            }
        }

        rest = &reference[end + 1..];
    }

    out.push_str(rest);
    out
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub session: SessionConfig,
    pub tls: TlsConfig,
    pub persistence: PersistenceConfig,
    pub experimental: ExperimentalConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Connection worker threads (0 = CPU count).
    pub workers: usize,
    /// Publish fan-out worker threads (0 = CPU count).
    pub fanout_workers: usize,
    /// Fan-out queue capacity per worker.
    pub queue_size: usize,
    /// $SYS publish interval in seconds (0 disables the tree).
    pub sys_interval: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.parse().unwrap(),
            workers: 0,
            fanout_workers: 0,
            queue_size: DEFAULT_QUEUE_SIZE,
            sys_interval: DEFAULT_SYS_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum accepted packet size in bytes (0 = unlimited).
    pub max_packet_size: usize,
    /// Maximum topic length in bytes (0 = unlimited).
    pub max_topic_length: usize,
    /// Maximum topic depth in levels (0 = unlimited).
    pub max_topic_levels: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_topic_length: DEFAULT_MAX_TOPIC_LENGTH,
            max_topic_levels: DEFAULT_MAX_TOPIC_LEVELS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Keep-alive applied when the client requests 0.
    pub default_keep_alive: u16,
    /// Upper bound on the negotiated keep-alive.
    pub max_keep_alive: u16,
    /// Bound of the per-session offline queue (drop-oldest).
    pub offline_queue: usize,
    /// Reader-writer lock shards in the session table.
    pub lock_shards: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_keep_alive: DEFAULT_KEEP_ALIVE,
            max_keep_alive: DEFAULT_MAX_KEEP_ALIVE,
            offline_queue: DEFAULT_OFFLINE_QUEUE,
            lock_shards: DEFAULT_LOCK_SHARDS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub bind: SocketAddr,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: DEFAULT_TLS_BIND.parse().unwrap(),
            cert: PathBuf::new(),
            key: PathBuf::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("plume-data"),
        }
    }
}

/// Flags selecting the alternative dispatch code paths.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExperimentalConfig {
    /// qos1 publishes go through the retrying coordinator.
    pub qos1: bool,
    /// Per-client identifier allocation instead of the shared engine table.
    pub newid: bool,
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Config(config::ConfigError),
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl Config {
    /// Load configuration from a TOML file plus environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", DEFAULT_BIND)?
            .set_default("server.workers", 0)?
            .set_default("server.fanout_workers", 0)?
            .set_default("server.queue_size", DEFAULT_QUEUE_SIZE as i64)?
            .set_default("server.sys_interval", DEFAULT_SYS_INTERVAL as i64)?
            .set_default("limits.max_packet_size", DEFAULT_MAX_PACKET_SIZE as i64)?
            .set_default("limits.max_topic_length", DEFAULT_MAX_TOPIC_LENGTH as i64)?
            .set_default("limits.max_topic_levels", DEFAULT_MAX_TOPIC_LEVELS as i64)?
            .set_default("session.default_keep_alive", DEFAULT_KEEP_ALIVE as i64)?
            .set_default("session.max_keep_alive", DEFAULT_MAX_KEEP_ALIVE as i64)?
            .set_default("session.offline_queue", DEFAULT_OFFLINE_QUEUE as i64)?
            .set_default("session.lock_shards", DEFAULT_LOCK_SHARDS as i64)?
            .set_default("tls.enabled", false)?
            .set_default("tls.bind", DEFAULT_TLS_BIND)?
            .set_default("persistence.enabled", false)?
            .set_default("experimental.qos1", false)?
            .set_default("experimental.newid", false)?;

        let path = path.as_ref();
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let expanded = expand_env_refs(&content);
            builder = builder.add_source(File::from_str(&expanded, FileFormat::Toml));
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("PLUME")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (for tests).
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_refs(content);
        let config: Config = toml::from_str(&expanded)
            .map_err(|e| ConfigError::Validation(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.lock_shards == 0 {
            return Err(ConfigError::Validation(
                "session.lock_shards must be at least 1".into(),
            ));
        }
        if self.server.queue_size == 0 {
            return Err(ConfigError::Validation(
                "server.queue_size must be at least 1".into(),
            ));
        }
        if self.tls.enabled {
            if self.tls.cert.as_os_str().is_empty() || self.tls.key.as_os_str().is_empty() {
                return Err(ConfigError::Validation(
                    "tls.cert and tls.key are required when tls.enabled".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.lock_shards, 64);
        assert_eq!(config.session.offline_queue, 1000);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[log]
level = "debug"

[server]
bind = "127.0.0.1:1884"
workers = 4
sys_interval = 1

[limits]
max_packet_size = 2097152

[session]
default_keep_alive = 120

[experimental]
qos1 = true
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.server.bind.port(), 1884);
        assert_eq!(config.server.workers, 4);
        assert_eq!(config.limits.max_packet_size, 2097152);
        assert_eq!(config.session.default_keep_alive, 120);
        assert!(config.experimental.qos1);
        assert!(!config.experimental.newid);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::parse("[limits]\nmax_packet_size = 512000\n").unwrap();
        assert_eq!(config.limits.max_packet_size, 512000);
        assert_eq!(config.limits.max_topic_levels, DEFAULT_MAX_TOPIC_LEVELS);
        assert_eq!(config.server.bind.port(), 1883);
    }

    #[test]
    fn test_env_expansion_set_and_unset() {
        std::env::set_var("PLUME_TEST_PORT", "1885");
        std::env::remove_var("PLUME_TEST_NONEXISTENT");

        let content = r#"bind = "${PLUME_TEST_HOST:-0.0.0.0}:${PLUME_TEST_PORT}""#;
        assert_eq!(expand_env_refs(content), r#"bind = "0.0.0.0:1885""#);

        assert_eq!(expand_env_refs("${PLUME_TEST_NONEXISTENT}"), "");

        std::env::remove_var("PLUME_TEST_PORT");
    }

    #[test]
    fn test_env_expansion_leaves_malformed_refs_alone() {
        assert_eq!(expand_env_refs("${unterminated"), "${unterminated");
        assert_eq!(expand_env_refs("a ${} b"), "a ${} b");
        assert_eq!(expand_env_refs("${odd:name}"), "${odd:name}");
        assert_eq!(expand_env_refs("no refs here"), "no refs here");
    }

    #[test]
    fn test_tls_requires_cert_and_key() {
        let err = Config::parse("[tls]\nenabled = true\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
