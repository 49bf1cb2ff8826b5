//! Response synthesis.
//!
//! Turns a matched rule into a concrete response. Stages run in a fixed
//! order: sequence selection, chaos, latency, response script, templating,
//! then callback scheduling. A response produced by a match script skips all
//! of them.

mod chaos;
mod latency;

pub use chaos::{decide_chaos, ChaosDecision};
pub use latency::{sample_latency, sample_percentile};

use crate::callback::{CallbackDispatcher, CallbackRequest};
use crate::config::CallbackConfig;
use crate::observe::Observer;
use crate::request::RequestView;
use crate::rule::{render_body, ResponseDescriptor, Rule};
use crate::scripting::{GlobalState, ResponseOverride, ScriptRuntime};
use crate::store::SequenceCursor;
use crate::template::TemplateEngine;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A finished response, ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseOutcome {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Rule that produced the response
    pub rule: String,
    /// A chaos failure replaced the configured response
    pub chaos: bool,
    /// A script produced the response
    pub scripted: bool,
}

impl ResponseOutcome {
    pub fn from_override(rule: &str, response: ResponseOverride) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            body: response.body,
            rule: rule.to_string(),
            chaos: false,
            scripted: true,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub struct Synthesizer {
    templates: Arc<TemplateEngine>,
    callbacks: CallbackDispatcher,
    runtime: Arc<dyn ScriptRuntime>,
    state: GlobalState,
    observer: Arc<dyn Observer>,
}

impl Synthesizer {
    pub fn new(
        templates: Arc<TemplateEngine>,
        callbacks: CallbackDispatcher,
        runtime: Arc<dyn ScriptRuntime>,
        state: GlobalState,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            templates,
            callbacks,
            runtime,
            state,
            observer,
        }
    }

    /// Build the response for `rule`. `response` is the match script's
    /// output, if any, and is returned untouched.
    pub async fn synthesize(
        &self,
        rule: &Rule,
        cursor: Option<&SequenceCursor>,
        request: &RequestView,
        response: Option<ResponseOverride>,
    ) -> ResponseOutcome {
        if let Some(response) = response {
            return ResponseOutcome::from_override(rule.name(), response);
        }

        let index = match (rule.response.is_sequence(), cursor) {
            (true, Some(cursor)) => cursor.advance(),
            _ => 0,
        };
        let descriptor = rule.response.select(index);

        let decision = descriptor
            .chaos
            .as_ref()
            .and_then(|chaos| decide_chaos(chaos, &mut rand::thread_rng()));
        if let Some(decision) = decision {
            sleep(decision.delay).await;
            if let Some(status) = decision.failure {
                debug!("Chaos failure {} injected for rule '{}'", status, rule.name());
                self.observer.on_chaos(rule.name(), status);
                return ResponseOutcome {
                    status,
                    headers: Vec::new(),
                    body: Bytes::new(),
                    rule: rule.name().to_string(),
                    chaos: true,
                    scripted: false,
                };
            }
        }

        sleep(Duration::from_millis(descriptor.delay_ms)).await;
        if let Some(latency) = &descriptor.latency {
            let delay = sample_latency(latency, &mut rand::thread_rng());
            sleep(delay).await;
        }

        let mut context: Option<Value> = None;
        let outcome = match self.run_response_script(rule, descriptor, request).await {
            Some(response) => ResponseOutcome::from_override(rule.name(), response),
            None => self.render(rule, descriptor, request, &mut context),
        };

        if let Some(callback) = &descriptor.callback {
            let context = context.get_or_insert_with(|| TemplateEngine::context(request));
            let callback = self.render_callback(rule, callback, context);
            self.callbacks.dispatch(callback);
        }

        outcome
    }

    async fn run_response_script(
        &self,
        rule: &Rule,
        descriptor: &ResponseDescriptor,
        request: &RequestView,
    ) -> Option<ResponseOverride> {
        let script = descriptor.script.clone()?;
        let runtime = self.runtime.clone();
        let state = self.state.clone();
        let request = request.clone();
        let result = tokio::task::spawn_blocking(move || {
            runtime.generate_response(&script, &request, &state)
        })
        .await;

        match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("Response script for rule '{}' failed: {}", rule.name(), e);
                self.observer.on_script_error(rule.name(), &e);
                None
            }
            Err(e) => {
                warn!("Response script for rule '{}' panicked: {}", rule.name(), e);
                None
            }
        }
    }

    fn render(
        &self,
        rule: &Rule,
        descriptor: &ResponseDescriptor,
        request: &RequestView,
        context: &mut Option<Value>,
    ) -> ResponseOutcome {
        let mut headers = descriptor.headers.clone();
        let mut body = descriptor.body.clone();

        if descriptor.template || descriptor.template_headers {
            let context = context.get_or_insert_with(|| TemplateEngine::context(request));
            if descriptor.template {
                body = self.templates.render(&body, context);
            }
            if descriptor.template_headers {
                for (_, value) in headers.iter_mut() {
                    *value = self.templates.render(value, context);
                }
            }
        }

        ResponseOutcome {
            status: descriptor.status,
            headers,
            body: Bytes::from(body),
            rule: rule.name().to_string(),
            chaos: false,
            scripted: false,
        }
    }

    fn render_callback(
        &self,
        rule: &Rule,
        callback: &CallbackConfig,
        context: &Value,
    ) -> CallbackRequest {
        let render = |text: &str| {
            if callback.template {
                self.templates.render(text, context)
            } else {
                text.to_string()
            }
        };
        CallbackRequest {
            rule: rule.name().to_string(),
            url: render(&callback.url),
            method: callback.method.clone(),
            headers: callback
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), render(v)))
                .collect(),
            body: callback
                .body
                .as_ref()
                .map(|b| render(&render_body(b)))
                .unwrap_or_default(),
            delay: Duration::from_millis(callback.delay_ms),
        }
    }
}

async fn sleep(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleDefinition;
    use crate::observe::NoopObserver;
    use crate::scripting::RhaiRuntime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[derive(Default)]
    struct ChaosCounter(AtomicUsize);

    impl Observer for ChaosCounter {
        fn on_chaos(&self, _rule: &str, _status: u16) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn synthesizer_with(observer: Arc<dyn Observer>) -> Synthesizer {
        Synthesizer::new(
            Arc::new(TemplateEngine::new()),
            CallbackDispatcher::new(Duration::from_secs(1), observer.clone()).unwrap(),
            Arc::new(RhaiRuntime::new()),
            GlobalState::new(),
            observer,
        )
    }

    fn synthesizer() -> Synthesizer {
        synthesizer_with(Arc::new(NoopObserver))
    }

    fn rule(yaml: &str) -> Rule {
        let def: RuleDefinition = serde_yaml::from_str(yaml).unwrap();
        Rule::compile(&def, 0, &RhaiRuntime::new()).unwrap()
    }

    #[tokio::test]
    async fn test_static_response() {
        let rule = rule(
            r#"
name: static
response:
  status: 201
  headers: { x-kind: static }
  body: created
"#,
        );
        let out = synthesizer()
            .synthesize(&rule, None, &RequestView::new("POST", "/"), None)
            .await;
        assert_eq!(out.status, 201);
        assert_eq!(out.header("x-kind"), Some("static"));
        assert_eq!(out.body, Bytes::from("created"));
        assert_eq!(out.rule, "static");
        assert!(!out.chaos && !out.scripted);
    }

    #[tokio::test]
    async fn test_override_is_returned_verbatim() {
        let rule = rule("name: r\nresponse: { status: 200, body: configured, template: true }");
        let response = ResponseOverride {
            status: 418,
            headers: vec![("x-from".to_string(), "script".to_string())],
            body: Bytes::from("{{method}}"),
        };
        let out = synthesizer()
            .synthesize(&rule, None, &RequestView::new("GET", "/"), Some(response))
            .await;
        assert_eq!(out.status, 418);
        assert_eq!(out.body, Bytes::from("{{method}}"));
        assert!(out.scripted);
    }

    #[tokio::test]
    async fn test_sequence_cycles_with_cursor() {
        let rule = rule(
            r#"
name: seq
sequence:
  mode: cycle
  responses:
    - { status: 200, body: first }
    - { status: 503, body: second }
"#,
        );
        let synth = synthesizer();
        let cursor = SequenceCursor::new();
        let req = RequestView::new("GET", "/");
        let mut statuses = Vec::new();
        for _ in 0..4 {
            statuses.push(synth.synthesize(&rule, Some(&cursor), &req, None).await.status);
        }
        assert_eq!(statuses, vec![200, 503, 200, 503]);
    }

    #[tokio::test]
    async fn test_chaos_always_fails() {
        let rule = rule(
            r#"
name: flaky
response:
  body: fine
  chaos: { enabled: true, failure_rate: 1.0, error_codes: [503] }
"#,
        );
        let counter = Arc::new(ChaosCounter::default());
        let synth = synthesizer_with(counter.clone());
        for _ in 0..20 {
            let out = synth
                .synthesize(&rule, None, &RequestView::new("GET", "/"), None)
                .await;
            assert_eq!(out.status, 503);
            assert!(out.body.is_empty());
            assert!(out.chaos);
        }
        assert_eq!(counter.0.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_chaos_never_fails_at_zero() {
        let rule = rule(
            r#"
name: calm
response:
  body: fine
  chaos: { enabled: true, failure_rate: 0.0, error_codes: [503] }
"#,
        );
        let synth = synthesizer();
        for _ in 0..20 {
            let out = synth
                .synthesize(&rule, None, &RequestView::new("GET", "/"), None)
                .await;
            assert_eq!(out.status, 200);
            assert!(!out.chaos);
        }
    }

    #[tokio::test]
    async fn test_delay_and_latency_are_applied() {
        let rule = rule(
            r#"
name: slow
response:
  delay_ms: 30
  latency: { kind: fixed, delay_ms: 20 }
"#,
        );
        let started = Instant::now();
        synthesizer()
            .synthesize(&rule, None, &RequestView::new("GET", "/"), None)
            .await;
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_templated_body_and_headers() {
        let rule = rule(
            r#"
name: tpl
response:
  headers: { x-echo: "{{query.id}}", x-raw: "{{query.id}}" }
  body: '{"id": "{{query.id}}", "method": "{{request.method}}"}'
  template: true
"#,
        );
        let out = synthesizer()
            .synthesize(&rule, None, &RequestView::new("GET", "/items?id=7"), None)
            .await;
        assert_eq!(out.body, Bytes::from(r#"{"id": "7", "method": "GET"}"#));
        // Headers are only rendered when asked to
        assert_eq!(out.header("x-echo"), Some("{{query.id}}"));

        let rule = self::rule(
            r#"
name: tpl-headers
response:
  headers: { x-echo: "{{query.id}}" }
  template_headers: true
"#,
        );
        let out = synthesizer()
            .synthesize(&rule, None, &RequestView::new("GET", "/items?id=7"), None)
            .await;
        assert_eq!(out.header("x-echo"), Some("7"));
    }

    #[tokio::test]
    async fn test_bad_template_keeps_literal_body() {
        let rule = rule(
            r#"
name: bad-date
response:
  body: 'at {{now "%Q"}}'
  template: true
"#,
        );
        let out = synthesizer()
            .synthesize(&rule, None, &RequestView::new("GET", "/"), None)
            .await;
        assert_eq!(out.status, 200);
        assert_eq!(out.body, Bytes::from(r#"at {{now "%Q"}}"#));
    }

    #[tokio::test]
    async fn test_response_script_replaces_configured_response() {
        let rule = rule(
            r#"
name: scripted
response:
  status: 200
  body: configured
  script: |
    let n = state.increment("hits", 1);
    #{ status: 202, body: #{ hits: n } }
"#,
        );
        let synth = synthesizer();
        let req = RequestView::new("GET", "/");
        synth.synthesize(&rule, None, &req, None).await;
        let out = synth.synthesize(&rule, None, &req, None).await;
        assert_eq!(out.status, 202);
        assert!(out.scripted);
        assert_eq!(out.body, Bytes::from(r#"{"hits":2}"#));
    }

    #[tokio::test]
    async fn test_failing_response_script_keeps_configured_response() {
        let rule = rule(
            r#"
name: broken
response:
  status: 200
  body: configured
  script: 'throw "boom";'
"#,
        );
        let out = synthesizer()
            .synthesize(&rule, None, &RequestView::new("GET", "/"), None)
            .await;
        assert_eq!(out.status, 200);
        assert_eq!(out.body, Bytes::from("configured"));
        assert!(!out.scripted);
    }

    #[test]
    fn test_callback_rendering() {
        let rule = rule(
            r#"
name: hook
response:
  callback:
    url: "http://localhost:9000/hooks/{{query.id}}"
    headers: { x-id: "{{query.id}}" }
    body: { order: "{{query.id}}" }
    delay_ms: 5
    template: true
"#,
        );
        let synth = synthesizer();
        let context = TemplateEngine::context(&RequestView::new("GET", "/?id=9"));
        let callback = rule.response.select(0).callback.clone().unwrap();
        let request = synth.render_callback(&rule, &callback, &context);
        assert_eq!(request.url, "http://localhost:9000/hooks/9");
        assert_eq!(request.method, "POST");
        assert_eq!(request.headers, vec![("x-id".to_string(), "9".to_string())]);
        assert_eq!(request.body, r#"{"order":"9"}"#);
        assert_eq!(request.delay, Duration::from_millis(5));
    }
}
