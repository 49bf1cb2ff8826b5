//! Error types shared across the engine.
//!
//! Load-time problems (`RuleError`, `LoadError`) are collected into a
//! [`ValidationReport`] instead of aborting a load. Match-time and
//! synthesis-time problems never leave the request path as errors; callers log
//! them and degrade to "no match" or a best-effort response.

use serde::Serialize;
use std::path::PathBuf;

/// A rule that failed compile-time validation and was skipped.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuleError {
    #[error("rule '{rule}': invalid regex for {field}: {message}")]
    InvalidRegex {
        rule: String,
        field: String,
        message: String,
    },
    #[error("rule '{rule}': invalid JSON path '{path}': {message}")]
    InvalidJsonPath {
        rule: String,
        path: String,
        message: String,
    },
    #[error("rule '{rule}': invalid JSON schema: {message}")]
    InvalidSchema { rule: String, message: String },
    #[error("rule '{rule}': invalid script: {source}")]
    InvalidScript {
        rule: String,
        #[source]
        source: ScriptError,
    },
    #[error("rule '{rule}': {message}")]
    InvalidConfig { rule: String, message: String },
}

impl RuleError {
    pub fn rule(&self) -> &str {
        match self {
            RuleError::InvalidRegex { rule, .. }
            | RuleError::InvalidJsonPath { rule, .. }
            | RuleError::InvalidSchema { rule, .. }
            | RuleError::InvalidScript { rule, .. }
            | RuleError::InvalidConfig { rule, .. } => rule,
        }
    }
}

/// A rule file that could not be read or parsed; its rules are skipped.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

impl LoadError {
    pub fn path(&self) -> &std::path::Path {
        match self {
            LoadError::Io { path, .. } | LoadError::Parse { path, .. } => path,
        }
    }
}

/// Script compilation or execution failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScriptError {
    #[error("compile error: {0}")]
    Compile(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("invalid script result: {0}")]
    InvalidResult(String),
}

/// Outbound callback delivery failure.
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("invalid callback method '{0}'")]
    InvalidMethod(String),
    #[error("callback request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("callback returned status {0}")]
    Status(u16),
}

/// Server configuration problems. Always fatal at start-up.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// One entry in a [`ValidationReport`].
#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    /// File the problem came from, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    /// Rule name, when the problem is scoped to a single rule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    pub message: String,
}

/// Aggregate of every load-time problem seen while building a snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub loaded: usize,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn push_load_error(&mut self, err: &LoadError) {
        self.issues.push(ValidationIssue {
            file: Some(err.path().to_path_buf()),
            rule: None,
            message: err.to_string(),
        });
    }

    pub fn push_rule_error(&mut self, file: Option<PathBuf>, err: &RuleError) {
        self.issues.push(ValidationIssue {
            file,
            rule: Some(err.rule().to_string()),
            message: err.to_string(),
        });
    }

    /// Log every issue at warn level, plus a one-line summary.
    pub fn log(&self) {
        for issue in &self.issues {
            match &issue.file {
                Some(file) => tracing::warn!("Skipped ({}): {}", file.display(), issue.message),
                None => tracing::warn!("Skipped: {}", issue.message),
            }
        }
        if self.is_clean() {
            tracing::info!("Loaded {} rules", self.loaded);
        } else {
            tracing::warn!(
                "Loaded {} rules, {} validation issues",
                self.loaded,
                self.issues.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_error_names_rule() {
        let err = RuleError::InvalidRegex {
            rule: "users".to_string(),
            field: "uri".to_string(),
            message: "unclosed group".to_string(),
        };
        assert_eq!(err.rule(), "users");
        assert!(err.to_string().contains("invalid regex for uri"));
    }

    #[test]
    fn test_report_collects_issues() {
        let mut report = ValidationReport::default();
        assert!(report.is_clean());

        report.push_load_error(&LoadError::Parse {
            path: PathBuf::from("rules/bad.yaml"),
            message: "expected a mapping".to_string(),
        });
        report.push_rule_error(
            None,
            &RuleError::InvalidSchema {
                rule: "orders".to_string(),
                message: "type must be a string".to_string(),
            },
        );

        assert!(!report.is_clean());
        assert_eq!(report.issues.len(), 2);
        assert_eq!(
            report.issues[0].file.as_deref(),
            Some(std::path::Path::new("rules/bad.yaml"))
        );
        assert_eq!(report.issues[1].rule.as_deref(), Some("orders"));
    }
}
