//! Request predicates.
//!
//! A rule's predicate is either a set of static matchers that must all hold,
//! or a script that decides on its own. A script predicate ignores every
//! static field configured next to it.

mod field;
mod json_path;
mod schema;

pub use field::{CompiledField, HeaderMatcher};
pub use json_path::JsonPathMatcher;
pub use schema::SchemaGate;

use crate::config::PredicateConfig;
use crate::error::{RuleError, ScriptError};
use crate::request::RequestView;
use crate::scripting::{CompiledScript, GlobalState, ResponseOverride, ScriptRuntime};
use tracing::debug;

/// What a predicate needs besides the request.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub runtime: &'a dyn ScriptRuntime,
    pub state: &'a GlobalState,
}

#[derive(Debug, Clone, Default)]
pub struct PredicateMatch {
    pub matched: bool,
    /// Response supplied by a match script; bypasses synthesis
    pub response: Option<ResponseOverride>,
}

impl PredicateMatch {
    fn from_bool(matched: bool) -> Self {
        Self {
            matched,
            response: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Predicate {
    Static(StaticPredicate),
    Script(ScriptPredicate),
}

impl Predicate {
    /// Compile a predicate, reporting bad regexes, paths, schemas and scripts.
    pub fn compile(
        rule: &str,
        config: &PredicateConfig,
        runtime: &dyn ScriptRuntime,
    ) -> Result<Self, RuleError> {
        if let Some(source) = &config.script {
            let script = runtime
                .compile(source)
                .map_err(|source| RuleError::InvalidScript {
                    rule: rule.to_string(),
                    source,
                })?;
            return Ok(Predicate::Script(ScriptPredicate { script }));
        }
        StaticPredicate::compile(rule, config).map(Predicate::Static)
    }

    pub fn is_script(&self) -> bool {
        matches!(self, Predicate::Script(_))
    }

    pub fn evaluate(
        &self,
        request: &RequestView,
        ctx: EvalContext<'_>,
    ) -> Result<PredicateMatch, ScriptError> {
        match self {
            Predicate::Static(predicate) => Ok(PredicateMatch::from_bool(predicate.matches(request))),
            Predicate::Script(predicate) => predicate.evaluate(request, ctx),
        }
    }
}

/// Static matchers. Every configured matcher must hold.
#[derive(Debug, Clone, Default)]
pub struct StaticPredicate {
    method: Option<CompiledField>,
    uri: Option<CompiledField>,
    headers: Vec<HeaderMatcher>,
    body: Option<CompiledField>,
    json_paths: Vec<JsonPathMatcher>,
    schema: Option<SchemaGate>,
}

impl StaticPredicate {
    pub fn compile(rule: &str, config: &PredicateConfig) -> Result<Self, RuleError> {
        let method = config
            .method
            .as_ref()
            .map(|m| CompiledField::compile(rule, "method", m))
            .transpose()?;
        let uri = config
            .uri
            .as_ref()
            .map(|m| CompiledField::compile(rule, "uri", m))
            .transpose()?;
        let body = config
            .body
            .as_ref()
            .map(|m| CompiledField::compile(rule, "body", m))
            .transpose()?;
        let headers = config
            .headers
            .iter()
            .map(|(name, m)| HeaderMatcher::compile(rule, name, m))
            .collect::<Result<Vec<_>, _>>()?;
        let json_paths = config
            .json_path
            .iter()
            .map(|m| JsonPathMatcher::compile(rule, m))
            .collect::<Result<Vec<_>, _>>()?;
        let schema = config
            .json_schema
            .as_ref()
            .map(|s| SchemaGate::compile(rule, s))
            .transpose()?;

        Ok(Self {
            method,
            uri,
            headers,
            body,
            json_paths,
            schema,
        })
    }

    pub fn matches(&self, request: &RequestView) -> bool {
        // Schema is a precondition; nothing else is looked at when it fails.
        if let Some(schema) = &self.schema {
            if !schema.allows(request.json()) {
                return false;
            }
        }

        if let Some(method) = &self.method {
            if !method.matches(&request.method) {
                return false;
            }
        }

        if let Some(uri) = &self.uri {
            if !uri.matches(&request.path) {
                return false;
            }
        }

        if !self.headers.iter().all(|h| h.matches(&request.headers)) {
            return false;
        }

        if let Some(body) = &self.body {
            if !body.matches(&request.body_text()) {
                return false;
            }
        }

        if !self.json_paths.is_empty() {
            let Some(document) = request.json() else {
                debug!("Body is not JSON; json_path matchers fail");
                return false;
            };
            if let Some(failed) = self.json_paths.iter().find(|m| !m.matches(document)) {
                debug!("json_path {} did not match", failed.path());
                return false;
            }
        }

        true
    }
}

#[derive(Debug, Clone)]
pub struct ScriptPredicate {
    script: CompiledScript,
}

impl ScriptPredicate {
    pub fn evaluate(
        &self,
        request: &RequestView,
        ctx: EvalContext<'_>,
    ) -> Result<PredicateMatch, ScriptError> {
        let result = ctx
            .runtime
            .evaluate_match(&self.script, request, ctx.state)?;
        Ok(PredicateMatch {
            matched: result.matches,
            response: if result.matches { result.response } else { None },
        })
    }
}
