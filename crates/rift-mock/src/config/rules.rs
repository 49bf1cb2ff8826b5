//! Rule definitions as written in rule files.
//!
//! These are plain serde models. Nothing here is validated beyond what serde
//! enforces; [`crate::rule::Rule::compile`] turns a definition into the
//! immutable, matchable form and reports anything it cannot compile.

use super::protocol::Protocol;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleDefinition {
    pub name: String,
    /// Higher priorities are evaluated first; ties keep load order
    #[serde(default)]
    pub priority: i64,
    /// Scenario tags. Empty means visible in every scenario.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scenarios: Vec<String>,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub request: PredicateConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<SequenceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket: Option<WebSocketConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sse: Option<SseConfig>,
}

/// String matcher for a single request field.
///
/// A bare string is an exact match.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FieldMatch {
    Exact { exact: String },
    Regex { regex: String },
    Plain(String),
}

impl FieldMatch {
    pub fn exact(value: impl Into<String>) -> Self {
        FieldMatch::Exact {
            exact: value.into(),
        }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        FieldMatch::Regex {
            regex: pattern.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct PredicateConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<FieldMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<FieldMatch>,
    /// Header name to matcher. For a regex entry the key is itself a regex
    /// applied to header names.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, FieldMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<FieldMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub json_path: Vec<JsonPathMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<serde_json::Value>,
    /// Match script. When present every other field is ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonPathMatch {
    pub path: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub regex: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResponseConfig {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<BodyConfig>,
    #[serde(default)]
    pub delay_ms: u64,
    /// Render the body through the template engine
    #[serde(default)]
    pub template: bool,
    /// Render header values through the template engine
    #[serde(default)]
    pub template_headers: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chaos: Option<ChaosConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<CallbackConfig>,
    /// Response script; its returned map replaces status, headers and body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

fn default_status() -> u16 {
    200
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            status: default_status(),
            headers: BTreeMap::new(),
            body: None,
            delay_ms: 0,
            template: false,
            template_headers: false,
            chaos: None,
            latency: None,
            callback: None,
            script: None,
        }
    }
}

/// Response body: text as-is, anything else serialized as JSON.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum BodyConfig {
    Text(String),
    Json(serde_json::Value),
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ChaosConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub failure_rate: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_codes: Vec<u16>,
    #[serde(default)]
    pub latency_min_ms: u64,
    #[serde(default)]
    pub latency_max_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LatencyConfig {
    Fixed { delay_ms: u64 },
    Random { min_ms: u64, max_ms: u64 },
    Percentile { p50: u64, p95: u64, p99: u64 },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CallbackConfig {
    pub url: String,
    #[serde(default = "default_callback_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<BodyConfig>,
    /// Extra wait on top of the response delay
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub template: bool,
}

fn default_callback_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SequenceMode {
    #[default]
    Cycle,
    Once,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SequenceConfig {
    #[serde(default)]
    pub mode: SequenceMode,
    pub responses: Vec<ResponseConfig>,
}

// ===== Streaming =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WebSocketMode {
    #[default]
    Echo,
    Sequence,
    Broadcast,
    #[serde(alias = "javascript")]
    Script,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct WebSocketConfig {
    #[serde(default)]
    pub mode: WebSocketMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<MessageConfig>,
    /// Pause between sequence messages
    #[serde(default)]
    pub interval_ms: u64,
    /// Stop the sequence after this many messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_messages: Option<usize>,
    /// Broadcast admission limit, checked before upgrading
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// Render every sequence message through the template engine
    #[serde(default)]
    pub template: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessageConfig {
    pub data: BodyConfig,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub template: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SseMode {
    #[default]
    Once,
    Cycle,
    #[serde(alias = "javascript")]
    Script,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SseConfig {
    #[serde(default)]
    pub mode: SseMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<EventConfig>,
    #[serde(default = "default_sse_interval")]
    pub interval_ms: u64,
    /// Emit a comment line at this period while cycling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default)]
    pub template: bool,
}

fn default_sse_interval() -> u64 {
    1000
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            mode: SseMode::default(),
            events: Vec::new(),
            interval_ms: default_sse_interval(),
            keep_alive_ms: None,
            script: None,
            template: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    pub data: BodyConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_ms: Option<u64>,
    #[serde(default)]
    pub delay_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_rule() {
        let yaml = r#"
name: users
request:
  method: GET
  uri: /api/users/123
response:
  status: 200
  body: '{"id": 123}'
"#;
        let rule: RuleDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.name, "users");
        assert_eq!(rule.priority, 0);
        assert_eq!(rule.protocol, Protocol::Http);
        assert_eq!(rule.request.method, Some(FieldMatch::Plain("GET".into())));
        let response = rule.response.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(
            response.body,
            Some(BodyConfig::Text("{\"id\": 123}".to_string()))
        );
    }

    #[test]
    fn test_parse_field_match_forms() {
        let m: FieldMatch = serde_yaml::from_str("{ regex: '^/a/\\d+$' }").unwrap();
        assert_eq!(m, FieldMatch::regex("^/a/\\d+$"));
        let m: FieldMatch = serde_yaml::from_str("{ exact: /a }").unwrap();
        assert_eq!(m, FieldMatch::exact("/a"));
        let m: FieldMatch = serde_yaml::from_str("/a").unwrap();
        assert_eq!(m, FieldMatch::Plain("/a".into()));
    }

    #[test]
    fn test_parse_json_body() {
        let yaml = r#"
status: 201
body:
  id: 7
  tags: [a, b]
"#;
        let response: ResponseConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(response.status, 201);
        match response.body {
            Some(BodyConfig::Json(v)) => assert_eq!(v["id"], 7),
            other => panic!("expected json body, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_latency_kinds() {
        let l: LatencyConfig = serde_yaml::from_str("{ kind: fixed, delay_ms: 10 }").unwrap();
        assert_eq!(l, LatencyConfig::Fixed { delay_ms: 10 });
        let l: LatencyConfig =
            serde_yaml::from_str("{ kind: percentile, p50: 100, p95: 500, p99: 1000 }").unwrap();
        assert_eq!(
            l,
            LatencyConfig::Percentile {
                p50: 100,
                p95: 500,
                p99: 1000
            }
        );
    }

    #[test]
    fn test_parse_sequence_and_streaming() {
        let yaml = r#"
name: feed
protocol: websocket
sequence:
  mode: once
  responses:
    - status: 200
    - status: 503
websocket:
  mode: javascript
  script: "conn.send(\"hi\");"
"#;
        let rule: RuleDefinition = serde_yaml::from_str(yaml).unwrap();
        let seq = rule.sequence.unwrap();
        assert_eq!(seq.mode, SequenceMode::Once);
        assert_eq!(seq.responses.len(), 2);
        assert_eq!(seq.responses[1].status, 503);
        assert_eq!(rule.websocket.unwrap().mode, WebSocketMode::Script);
    }

    #[test]
    fn test_chaos_disabled_by_default() {
        let chaos: ChaosConfig = serde_yaml::from_str("failure_rate: 0.5").unwrap();
        assert!(!chaos.enabled);
        assert!(chaos.error_codes.is_empty());
    }
}
