//! Configuration types for the Rift mock server.

mod listen;
mod protocol;
pub mod rules;

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use listen::{ListenConfig, LogConfig, LogFormat};
pub use protocol::Protocol;
pub use rules::{
    BodyConfig, CallbackConfig, ChaosConfig, EventConfig, FieldMatch, JsonPathMatch,
    LatencyConfig, MessageConfig, PredicateConfig, ResponseConfig, RuleDefinition,
    SequenceConfig, SequenceMode, SseConfig, SseMode, WebSocketConfig, WebSocketMode,
};

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    /// Active scenario at start-up. None means every rule is visible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    #[serde(default)]
    pub reload: ReloadConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub callbacks: CallbackClientConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RulesConfig {
    /// Root directories scanned recursively for rule files
    #[serde(default = "default_rule_dirs")]
    pub dirs: Vec<PathBuf>,
}

fn default_rule_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("rules")]
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            dirs: default_rule_dirs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReloadConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    100
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: default_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ValidationConfig {
    /// Refuse to start when any rule file or rule fails to load
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CallbackClientConfig {
    #[serde(default = "default_callback_timeout")]
    pub timeout_secs: u64,
}

fn default_callback_timeout() -> u64 {
    30
}

impl Default for CallbackClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_callback_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackerConfig {
    /// Number of recent requests kept in memory
    #[serde(default = "default_tracker_capacity")]
    pub capacity: usize,
}

fn default_tracker_capacity() -> usize {
    500
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            capacity: default_tracker_capacity(),
        }
    }
}

impl ServerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ServerConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rules.dirs.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one rule directory is required in 'rules.dirs'".to_string(),
            ));
        }
        if self.listen.host.trim().is_empty() {
            return Err(ConfigError::Invalid("'listen.host' must not be empty".to_string()));
        }
        if self.reload.enabled && self.reload.debounce_ms == 0 {
            return Err(ConfigError::Invalid(
                "'reload.debounce_ms' must be greater than 0 when reload is enabled".to_string(),
            ));
        }
        if self.callbacks.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "'callbacks.timeout_secs' must be greater than 0".to_string(),
            ));
        }
        if let Some(scenario) = &self.scenario {
            if scenario.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "'scenario' must not be an empty string".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen.host, self.listen.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config: ServerConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.listen.port, 8080);
        assert_eq!(config.rules.dirs, vec![PathBuf::from("rules")]);
        assert!(config.reload.enabled);
        assert_eq!(config.reload.debounce_ms, 100);
        assert!(!config.validation.strict);
        assert_eq!(config.callbacks.timeout_secs, 30);
        assert_eq!(config.tracker.capacity, 500);
        assert_eq!(config.log.format, LogFormat::Text);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full() {
        let yaml = r#"
listen:
  host: 127.0.0.1
  port: 9090
rules:
  dirs: [mocks, more-mocks]
scenario: outage
reload:
  debounce_ms: 250
validation:
  strict: true
log:
  level: debug
  format: json
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:9090");
        assert_eq!(config.rules.dirs.len(), 2);
        assert_eq!(config.scenario.as_deref(), Some("outage"));
        assert_eq!(config.reload.debounce_ms, 250);
        assert!(config.validation.strict);
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_validate_rejects_empty_dirs() {
        let config: ServerConfig = serde_yaml::from_str("rules: { dirs: [] }").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listen:\n  port: 7001").unwrap();
        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.listen.port, 7001);

        let missing = ServerConfig::from_file("/nonexistent/rift-mock.yaml");
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
