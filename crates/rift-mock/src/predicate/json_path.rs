//! JSON-path body matchers (RFC 9535 syntax via `serde_json_path`).
//!
//! Paths may omit the leading `$`: `user.id` is read as `$.user.id`.

use crate::config::JsonPathMatch;
use crate::error::RuleError;
use regex::Regex;
use serde_json::Value;
use serde_json_path::JsonPath;

#[derive(Debug, Clone)]
enum Expected {
    Exact(String),
    Regex(Regex),
}

#[derive(Debug, Clone)]
pub struct JsonPathMatcher {
    raw: String,
    path: JsonPath,
    expected: Expected,
}

impl JsonPathMatcher {
    pub fn compile(rule: &str, config: &JsonPathMatch) -> Result<Self, RuleError> {
        let normalized = normalize_path(&config.path);
        let path = JsonPath::parse(&normalized).map_err(|e| RuleError::InvalidJsonPath {
            rule: rule.to_string(),
            path: config.path.clone(),
            message: e.to_string(),
        })?;

        let expected_text = scalar_text(&config.value);
        let expected = if config.regex {
            let regex = super::field::compile_regex(
                rule,
                &format!("json path '{}'", config.path),
                &expected_text,
            )?;
            Expected::Regex(regex)
        } else {
            Expected::Exact(expected_text)
        };

        Ok(Self {
            raw: config.path.clone(),
            path,
            expected,
        })
    }

    pub fn path(&self) -> &str {
        &self.raw
    }

    /// True when any node selected by the path matches the expected value.
    pub fn matches(&self, document: &Value) -> bool {
        self.path
            .query(document)
            .all()
            .into_iter()
            .any(|node| {
                let text = scalar_text(node);
                match &self.expected {
                    Expected::Exact(expected) => *expected == text,
                    Expected::Regex(regex) => regex.is_match(&text),
                }
            })
    }
}

fn normalize_path(path: &str) -> String {
    let path = path.trim();
    if path.starts_with('$') {
        path.to_string()
    } else if path.starts_with('[') {
        format!("${path}")
    } else {
        format!("$.{path}")
    }
}

/// String rendering used on both sides of a comparison.
pub(crate) fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}
