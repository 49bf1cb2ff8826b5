//! The mock engine: rule store, resolution and synthesis behind one handle.
//!
//! Transports hand a [`RequestView`] to [`MockEngine::handle_request`] (plain
//! HTTP) or to [`MockEngine::resolve`] followed by a streaming adapter. Rule
//! changes go through [`MockEngine::reload`] or [`MockEngine::install`], both
//! of which build a complete snapshot before swapping it in.

use crate::callback::CallbackDispatcher;
use crate::config::RuleDefinition;
use crate::error::ValidationReport;
use crate::loader::{LoadedRules, RuleSource};
use crate::observe::{NoopObserver, NoopTracker, Observer, RequestSummary, RequestTracker};
use crate::predicate::EvalContext;
use crate::request::RequestView;
use crate::resolver::{Resolution, Resolver};
use crate::rule::Rule;
use crate::scripting::{default_runtime, GlobalState, ScriptRuntime};
use crate::store::{ConnectionSet, RuleStore, SequenceCursor, Snapshot};
use crate::synth::{ResponseOutcome, Synthesizer};
use crate::template::TemplateEngine;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Collaborators and settings for a [`MockEngine`].
pub struct EngineOptions {
    pub runtime: Arc<dyn ScriptRuntime>,
    pub state: GlobalState,
    pub observer: Arc<dyn Observer>,
    pub tracker: Arc<dyn RequestTracker>,
    /// Active scenario at start-up
    pub scenario: Option<String>,
    pub callback_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            state: GlobalState::new(),
            observer: Arc::new(NoopObserver),
            tracker: Arc::new(NoopTracker),
            scenario: None,
            callback_timeout: Duration::from_secs(30),
        }
    }
}

/// A resolved request, pinned to the snapshot it was resolved against.
#[derive(Debug, Clone)]
pub struct Matched {
    pub snapshot: Arc<Snapshot>,
    pub resolution: Resolution,
}

impl Matched {
    pub fn rule(&self) -> &Arc<Rule> {
        &self.resolution.rule
    }

    pub fn cursor(&self) -> Option<&SequenceCursor> {
        self.snapshot.cursor(self.resolution.position)
    }

    /// Connection set of a broadcast WebSocket rule.
    pub fn connections(&self) -> Option<&Arc<ConnectionSet>> {
        self.snapshot.connections(self.resolution.position)
    }
}

pub struct MockEngine {
    store: RuleStore,
    runtime: Arc<dyn ScriptRuntime>,
    state: GlobalState,
    observer: Arc<dyn Observer>,
    tracker: Arc<dyn RequestTracker>,
    scenario: RwLock<Option<String>>,
    source: Box<dyn RuleSource>,
    synthesizer: Synthesizer,
    templates: Arc<TemplateEngine>,
    /// Serializes compile-and-install so snapshot versions follow call order
    install_lock: Mutex<()>,
}

impl MockEngine {
    /// Create an engine with an empty rule set. Call [`MockEngine::reload`]
    /// to load rules from `source`.
    pub fn new(source: Box<dyn RuleSource>, options: EngineOptions) -> Result<Self, reqwest::Error> {
        let templates = Arc::new(TemplateEngine::new());
        let callbacks = CallbackDispatcher::new(options.callback_timeout, options.observer.clone())?;
        let synthesizer = Synthesizer::new(
            templates.clone(),
            callbacks,
            options.runtime.clone(),
            options.state.clone(),
            options.observer.clone(),
        );
        Ok(Self {
            store: RuleStore::new(),
            runtime: options.runtime,
            state: options.state,
            observer: options.observer,
            tracker: options.tracker,
            scenario: RwLock::new(options.scenario),
            source,
            synthesizer,
            templates,
            install_lock: Mutex::new(()),
        })
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.store.load()
    }

    pub fn state(&self) -> &GlobalState {
        &self.state
    }

    pub fn runtime(&self) -> &Arc<dyn ScriptRuntime> {
        &self.runtime
    }

    pub fn templates(&self) -> &Arc<TemplateEngine> {
        &self.templates
    }

    pub fn observer(&self) -> &Arc<dyn Observer> {
        &self.observer
    }

    pub fn scenario(&self) -> Option<String> {
        self.scenario.read().clone()
    }

    /// Switch the active scenario. `None` makes every rule visible.
    pub fn set_scenario(&self, scenario: Option<String>) {
        info!("Active scenario: {}", scenario.as_deref().unwrap_or("<all>"));
        *self.scenario.write() = scenario;
    }

    /// Re-read the rule source and install the result.
    pub fn reload(&self) -> ValidationReport {
        let loaded = self.source.load_all();
        self.install_loaded(loaded)
    }

    /// Install definitions supplied directly, replacing the current rules.
    pub fn install(&self, definitions: Vec<RuleDefinition>) -> ValidationReport {
        self.install_loaded(LoadedRules {
            definitions: definitions.into_iter().map(|d| (None, d)).collect(),
            errors: Vec::new(),
        })
    }

    fn install_loaded(&self, loaded: LoadedRules) -> ValidationReport {
        let _guard = self.install_lock.lock();
        let mut report = ValidationReport::default();
        for err in &loaded.errors {
            report.push_load_error(err);
        }

        let mut rules = Vec::with_capacity(loaded.definitions.len());
        for (ordinal, (file, definition)) in loaded.definitions.into_iter().enumerate() {
            match Rule::compile(&definition, ordinal, self.runtime.as_ref()) {
                Ok(rule) => rules.push(rule),
                Err(e) => report.push_rule_error(file, &e),
            }
        }
        report.loaded = rules.len();

        let snapshot = self.store.install(rules);
        info!(
            "Installed rule snapshot v{} ({} rules)",
            snapshot.version(),
            snapshot.len()
        );
        report.log();
        report
    }

    /// Find the rule for `request` in the current snapshot.
    ///
    /// Snapshots with match scripts are resolved on a blocking thread.
    pub async fn resolve(&self, request: &RequestView) -> Option<Matched> {
        let snapshot = self.store.load();
        let scenario = self.scenario();

        let resolution = if snapshot.has_scripts() {
            let snapshot = snapshot.clone();
            let request = request.clone();
            let runtime = self.runtime.clone();
            let state = self.state.clone();
            let observer = self.observer.clone();
            let result = tokio::task::spawn_blocking(move || {
                let ctx = EvalContext {
                    runtime: runtime.as_ref(),
                    state: &state,
                };
                Resolver::new(ctx, observer.as_ref()).resolve(&snapshot, &request, scenario.as_deref())
            })
            .await;
            match result {
                Ok(resolution) => resolution,
                Err(e) => {
                    warn!("Rule resolution task failed: {}", e);
                    None
                }
            }
        } else {
            let ctx = EvalContext {
                runtime: self.runtime.as_ref(),
                state: &self.state,
            };
            Resolver::new(ctx, self.observer.as_ref()).resolve(
                &snapshot,
                request,
                scenario.as_deref(),
            )
        };

        resolution.map(|resolution| Matched {
            snapshot,
            resolution,
        })
    }

    /// Resolve and synthesize a plain HTTP response. `None` means no rule
    /// matched.
    pub async fn handle_request(&self, request: &RequestView) -> Option<ResponseOutcome> {
        let started = Instant::now();
        match self.resolve(request).await {
            Some(matched) => Some(self.respond(&matched, request, started).await),
            None => {
                self.no_match(request, started);
                None
            }
        }
    }

    /// Synthesize the response for an already resolved request.
    pub async fn respond(
        &self,
        matched: &Matched,
        request: &RequestView,
        started: Instant,
    ) -> ResponseOutcome {
        let rule = matched.rule();
        self.observer.on_match(rule.name());
        let outcome = self
            .synthesizer
            .synthesize(
                rule,
                matched.cursor(),
                request,
                matched.resolution.response.clone(),
            )
            .await;
        self.record(request, Some(rule.name()), outcome.status, outcome.chaos, started);
        outcome
    }

    /// Report a request no rule matched.
    pub fn no_match(&self, request: &RequestView, started: Instant) {
        debug!("No rule matched {} {}", request.method, request.uri);
        self.observer.on_no_match(&request.method, &request.uri);
        self.record(request, None, 404, false, started);
    }

    /// Hand a summary of a finished request to the tracker.
    pub fn record(
        &self,
        request: &RequestView,
        rule: Option<&str>,
        status: u16,
        chaos: bool,
        started: Instant,
    ) {
        self.tracker.record(RequestSummary {
            timestamp: Utc::now(),
            method: request.method.clone(),
            uri: request.uri.clone(),
            rule: rule.map(str::to_string),
            status,
            chaos,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }
}
