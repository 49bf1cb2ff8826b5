//! Compiled, immutable rules.

use crate::config::{
    BodyConfig, CallbackConfig, ChaosConfig, LatencyConfig, Protocol, ResponseConfig,
    RuleDefinition, SequenceMode, SseConfig, SseMode, WebSocketConfig, WebSocketMode,
};
use crate::error::RuleError;
use crate::predicate::Predicate;
use crate::scripting::{CompiledScript, ScriptRuntime};
use std::collections::BTreeSet;
use std::fmt;

/// Rule identity: its name plus its position in load order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleId {
    pub name: String,
    pub ordinal: usize,
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.ordinal)
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: RuleId,
    pub priority: i64,
    pub scenarios: BTreeSet<String>,
    pub protocol: Protocol,
    pub predicate: Predicate,
    pub response: ResponseTemplate,
    pub websocket: Option<WebSocketSpec>,
    pub sse: Option<SseSpec>,
}

impl Rule {
    /// Compile a definition. `ordinal` is the rule's position in load order.
    pub fn compile(
        def: &RuleDefinition,
        ordinal: usize,
        runtime: &dyn ScriptRuntime,
    ) -> Result<Self, RuleError> {
        let name = def.name.as_str();
        if name.trim().is_empty() {
            return Err(invalid(name, "rule name must not be empty"));
        }

        let predicate = Predicate::compile(name, &def.request, runtime)?;
        let response = ResponseTemplate::compile(name, def, runtime)?;

        let websocket = match def.protocol {
            Protocol::WebSocket => Some(WebSocketSpec::compile(
                name,
                def.websocket.clone().unwrap_or_default(),
                runtime,
            )?),
            _ => None,
        };
        let sse = match def.protocol {
            Protocol::Sse => Some(SseSpec::compile(
                name,
                def.sse.clone().unwrap_or_default(),
                runtime,
            )?),
            _ => None,
        };

        Ok(Self {
            id: RuleId {
                name: def.name.clone(),
                ordinal,
            },
            priority: def.priority,
            scenarios: def.scenarios.iter().cloned().collect(),
            protocol: def.protocol,
            predicate,
            response,
            websocket,
            sse,
        })
    }

    pub fn name(&self) -> &str {
        &self.id.name
    }

    /// Untagged rules are visible in every scenario; with no active scenario
    /// every rule is visible.
    pub fn visible_in(&self, scenario: Option<&str>) -> bool {
        match scenario {
            None => true,
            Some(active) => self.scenarios.is_empty() || self.scenarios.contains(active),
        }
    }
}

fn invalid(rule: &str, message: impl Into<String>) -> RuleError {
    RuleError::InvalidConfig {
        rule: rule.to_string(),
        message: message.into(),
    }
}

#[derive(Debug, Clone)]
pub enum ResponseTemplate {
    Single(ResponseDescriptor),
    Sequence {
        mode: SequenceMode,
        responses: Vec<ResponseDescriptor>,
    },
}

impl ResponseTemplate {
    fn compile(
        rule: &str,
        def: &RuleDefinition,
        runtime: &dyn ScriptRuntime,
    ) -> Result<Self, RuleError> {
        match (&def.response, &def.sequence) {
            (Some(_), Some(_)) => Err(invalid(
                rule,
                "'response' and 'sequence' are mutually exclusive",
            )),
            (Some(response), None) => Ok(ResponseTemplate::Single(ResponseDescriptor::compile(
                rule, response, runtime,
            )?)),
            (None, Some(sequence)) => {
                if sequence.responses.is_empty() {
                    return Err(invalid(rule, "'sequence.responses' must not be empty"));
                }
                let responses = sequence
                    .responses
                    .iter()
                    .map(|r| ResponseDescriptor::compile(rule, r, runtime))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ResponseTemplate::Sequence {
                    mode: sequence.mode,
                    responses,
                })
            }
            (None, None) => Ok(ResponseTemplate::Single(ResponseDescriptor::compile(
                rule,
                &ResponseConfig::default(),
                runtime,
            )?)),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ResponseTemplate::Single(_) => 1,
            ResponseTemplate::Sequence { responses, .. } => responses.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Descriptor for the `cursor`-th match of the rule.
    pub fn select(&self, cursor: u64) -> &ResponseDescriptor {
        match self {
            ResponseTemplate::Single(descriptor) => descriptor,
            ResponseTemplate::Sequence { mode, responses } => {
                &responses[sequence_index(*mode, cursor, responses.len())]
            }
        }
    }

    pub fn is_sequence(&self) -> bool {
        matches!(self, ResponseTemplate::Sequence { .. })
    }
}

/// `cycle`: cursor mod len. `once`: the last response repeats once reached.
pub fn sequence_index(mode: SequenceMode, cursor: u64, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    match mode {
        SequenceMode::Cycle => (cursor % len as u64) as usize,
        SequenceMode::Once => cursor.min(len as u64 - 1) as usize,
    }
}

/// One concrete response a rule can produce.
#[derive(Debug, Clone)]
pub struct ResponseDescriptor {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub delay_ms: u64,
    pub template: bool,
    pub template_headers: bool,
    pub chaos: Option<ChaosConfig>,
    pub latency: Option<LatencyConfig>,
    pub callback: Option<CallbackConfig>,
    pub script: Option<CompiledScript>,
}

impl ResponseDescriptor {
    pub fn compile(
        rule: &str,
        config: &ResponseConfig,
        runtime: &dyn ScriptRuntime,
    ) -> Result<Self, RuleError> {
        if !(100..=999).contains(&config.status) {
            return Err(invalid(rule, format!("invalid status code {}", config.status)));
        }

        if let Some(chaos) = &config.chaos {
            if !(0.0..=1.0).contains(&chaos.failure_rate) {
                return Err(invalid(
                    rule,
                    format!("chaos.failure_rate {} is outside [0, 1]", chaos.failure_rate),
                ));
            }
            if chaos.latency_min_ms > chaos.latency_max_ms {
                return Err(invalid(rule, "chaos.latency_min_ms exceeds latency_max_ms"));
            }
            if let Some(code) = chaos
                .error_codes
                .iter()
                .find(|c| !(100..=999).contains(*c))
            {
                return Err(invalid(rule, format!("invalid chaos error code {code}")));
            }
        }

        match &config.latency {
            Some(LatencyConfig::Random { min_ms, max_ms }) if min_ms > max_ms => {
                return Err(invalid(rule, "latency.min_ms exceeds latency.max_ms"));
            }
            Some(LatencyConfig::Percentile { p50, p95, p99 }) if !(p50 <= p95 && p95 <= p99) => {
                return Err(invalid(rule, "latency percentiles must satisfy p50 <= p95 <= p99"));
            }
            _ => {}
        }

        if let Some(callback) = &config.callback {
            if !(callback.url.starts_with("http://") || callback.url.starts_with("https://")) {
                return Err(invalid(
                    rule,
                    format!("callback url '{}' must be http(s)", callback.url),
                ));
            }
            if hyper::Method::from_bytes(callback.method.as_bytes()).is_err() {
                return Err(invalid(
                    rule,
                    format!("invalid callback method '{}'", callback.method),
                ));
            }
        }

        let script = config
            .script
            .as_deref()
            .map(|source| {
                runtime
                    .compile(source)
                    .map_err(|source| RuleError::InvalidScript {
                        rule: rule.to_string(),
                        source,
                    })
            })
            .transpose()?;

        let mut headers: Vec<(String, String)> = config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let body = match &config.body {
            None => String::new(),
            Some(body) => {
                if matches!(body, BodyConfig::Json(_))
                    && !headers
                        .iter()
                        .any(|(k, _)| k.eq_ignore_ascii_case("content-type"))
                {
                    headers.push(("content-type".to_string(), "application/json".to_string()));
                }
                render_body(body)
            }
        };

        Ok(Self {
            status: config.status,
            headers,
            body,
            delay_ms: config.delay_ms,
            template: config.template,
            template_headers: config.template_headers,
            chaos: config.chaos.clone(),
            latency: config.latency.clone(),
            callback: config.callback.clone(),
            script,
        })
    }
}

/// Text form of a configured body; JSON values are serialized compactly.
pub fn render_body(body: &BodyConfig) -> String {
    match body {
        BodyConfig::Text(text) => text.clone(),
        BodyConfig::Json(value) => value.to_string(),
    }
}

/// WebSocket sub-configuration with its script compiled.
#[derive(Debug, Clone)]
pub struct WebSocketSpec {
    pub config: WebSocketConfig,
    pub script: Option<CompiledScript>,
}

impl WebSocketSpec {
    fn compile(
        rule: &str,
        config: WebSocketConfig,
        runtime: &dyn ScriptRuntime,
    ) -> Result<Self, RuleError> {
        let script = match config.mode {
            WebSocketMode::Script => {
                let source = config
                    .script
                    .as_deref()
                    .ok_or_else(|| invalid(rule, "websocket script mode requires 'script'"))?;
                Some(compile_script(rule, source, runtime)?)
            }
            _ => None,
        };
        if config.mode == WebSocketMode::Broadcast && config.max_connections == Some(0) {
            return Err(invalid(rule, "websocket.max_connections must be at least 1"));
        }
        Ok(Self { config, script })
    }

    pub fn mode(&self) -> WebSocketMode {
        self.config.mode
    }
}

/// SSE sub-configuration with its script compiled.
#[derive(Debug, Clone)]
pub struct SseSpec {
    pub config: SseConfig,
    pub script: Option<CompiledScript>,
}

impl SseSpec {
    fn compile(
        rule: &str,
        config: SseConfig,
        runtime: &dyn ScriptRuntime,
    ) -> Result<Self, RuleError> {
        let script = match config.mode {
            SseMode::Script => {
                let source = config
                    .script
                    .as_deref()
                    .ok_or_else(|| invalid(rule, "sse script mode requires 'script'"))?;
                Some(compile_script(rule, source, runtime)?)
            }
            SseMode::Cycle if config.events.is_empty() => {
                return Err(invalid(rule, "sse cycle mode requires at least one event"));
            }
            _ => None,
        };
        Ok(Self { config, script })
    }

    pub fn mode(&self) -> SseMode {
        self.config.mode
    }
}

fn compile_script(
    rule: &str,
    source: &str,
    runtime: &dyn ScriptRuntime,
) -> Result<CompiledScript, RuleError> {
    runtime
        .compile(source)
        .map_err(|source| RuleError::InvalidScript {
            rule: rule.to_string(),
            source,
        })
}
