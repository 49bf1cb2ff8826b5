//! First-match rule resolution over a snapshot.

use crate::observe::Observer;
use crate::predicate::EvalContext;
use crate::request::RequestView;
use crate::rule::Rule;
use crate::scripting::ResponseOverride;
use crate::store::Snapshot;
use std::sync::Arc;
use tracing::{debug, warn};

/// The rule chosen for a request.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub rule: Arc<Rule>,
    /// Position of the rule in the snapshot it was resolved from
    pub position: usize,
    /// Response produced by the rule's match script, if any
    pub response: Option<ResponseOverride>,
}

pub struct Resolver<'a> {
    ctx: EvalContext<'a>,
    observer: &'a dyn Observer,
}

impl<'a> Resolver<'a> {
    pub fn new(ctx: EvalContext<'a>, observer: &'a dyn Observer) -> Self {
        Self { ctx, observer }
    }

    /// Scan visible rules in snapshot order and return the first match.
    ///
    /// A failing match script counts as "no match" for its rule; the scan
    /// continues with the next one.
    pub fn resolve(
        &self,
        snapshot: &Snapshot,
        request: &RequestView,
        scenario: Option<&str>,
    ) -> Option<Resolution> {
        for (position, rule) in snapshot.rules().iter().enumerate() {
            if !rule.visible_in(scenario) {
                continue;
            }
            match rule.predicate.evaluate(request, self.ctx) {
                Ok(result) if result.matched => {
                    debug!(
                        "Request {} {} matched rule '{}'",
                        request.method,
                        request.uri,
                        rule.name()
                    );
                    return Some(Resolution {
                        rule: rule.clone(),
                        position,
                        response: result.response,
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Match script for rule '{}' failed: {}", rule.name(), e);
                    self.observer.on_script_error(rule.name(), &e);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleDefinition;
    use crate::observe::NoopObserver;
    use crate::scripting::{GlobalState, RhaiRuntime};

    fn snapshot(yaml: &str) -> Snapshot {
        let defs: Vec<RuleDefinition> = serde_yaml::from_str(yaml).unwrap();
        let runtime = RhaiRuntime::new();
        let rules = defs
            .iter()
            .enumerate()
            .map(|(i, d)| Rule::compile(d, i, &runtime).unwrap())
            .collect();
        Snapshot::new(1, rules)
    }

    fn resolve(snapshot: &Snapshot, request: &RequestView, scenario: Option<&str>) -> Option<String> {
        let runtime = RhaiRuntime::new();
        let state = GlobalState::new();
        let observer = NoopObserver;
        let resolver = Resolver::new(
            EvalContext {
                runtime: &runtime,
                state: &state,
            },
            &observer,
        );
        resolver
            .resolve(snapshot, request, scenario)
            .map(|r| r.rule.name().to_string())
    }

    #[test]
    fn test_exact_beats_lower_priority_regex() {
        let snap = snapshot(
            r#"
- name: any-user
  priority: 1
  request: { uri: { regex: '^/api/users/\d+$' } }
- name: user-123
  priority: 10
  request: { uri: /api/users/123 }
"#,
        );
        assert_eq!(
            resolve(&snap, &RequestView::new("GET", "/api/users/123"), None).as_deref(),
            Some("user-123")
        );
        assert_eq!(
            resolve(&snap, &RequestView::new("GET", "/api/users/456"), None).as_deref(),
            Some("any-user")
        );
        assert!(resolve(&snap, &RequestView::new("GET", "/api/orders"), None).is_none());
    }

    #[test]
    fn test_ties_keep_load_order() {
        let snap = snapshot(
            r#"
- name: first
- name: second
"#,
        );
        assert_eq!(
            resolve(&snap, &RequestView::new("GET", "/"), None).as_deref(),
            Some("first")
        );
    }

    #[test]
    fn test_scenario_filter() {
        let snap = snapshot(
            r#"
- name: outage
  priority: 10
  scenarios: [outage]
- name: normal
"#,
        );
        let req = RequestView::new("GET", "/");
        assert_eq!(resolve(&snap, &req, None).as_deref(), Some("outage"));
        assert_eq!(resolve(&snap, &req, Some("outage")).as_deref(), Some("outage"));
        assert_eq!(resolve(&snap, &req, Some("happy")).as_deref(), Some("normal"));
    }

    #[test]
    fn test_failing_script_falls_through() {
        let snap = snapshot(
            r#"
- name: broken
  priority: 5
  request: { script: 'throw "nope";' }
- name: fallback
"#,
        );
        assert_eq!(
            resolve(&snap, &RequestView::new("GET", "/"), None).as_deref(),
            Some("fallback")
        );
    }
}
