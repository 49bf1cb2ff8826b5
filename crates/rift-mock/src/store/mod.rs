//! Rule store: immutable snapshots behind a swappable pointer.
//!
//! Readers clone the current `Arc<Snapshot>` under a brief shared lock and
//! work on it without holding anything. Installing builds a complete snapshot
//! first and swaps it in under the exclusive lock, so a request sees either
//! the old rule set or the new one in full.

mod connections;
mod cursor;

pub use connections::{ConnectionSet, Membership, Outbox};
pub use cursor::SequenceCursor;

use crate::config::WebSocketMode;
use crate::rule::Rule;
use parking_lot::RwLock;
use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Complete, immutable set of active rules.
#[derive(Debug, Default)]
pub struct Snapshot {
    version: u64,
    rules: Vec<Arc<Rule>>,
    cursors: Vec<SequenceCursor>,
    connections: Vec<Option<Arc<ConnectionSet>>>,
    has_scripts: bool,
}

impl Snapshot {
    /// Order rules by descending priority; ties keep load order.
    pub fn new(version: u64, mut rules: Vec<Rule>) -> Self {
        rules.sort_by_key(|r| (Reverse(r.priority), r.id.ordinal));

        let cursors = rules.iter().map(|_| SequenceCursor::new()).collect();
        let connections = rules
            .iter()
            .map(|r| match &r.websocket {
                Some(ws) if ws.mode() == WebSocketMode::Broadcast => {
                    Some(Arc::new(ConnectionSet::new()))
                }
                _ => None,
            })
            .collect();
        let has_scripts = rules.iter().any(|r| r.predicate.is_script());

        Self {
            version,
            rules: rules.into_iter().map(Arc::new).collect(),
            cursors,
            connections,
            has_scripts,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rule(&self, position: usize) -> Option<&Arc<Rule>> {
        self.rules.get(position)
    }

    pub fn cursor(&self, position: usize) -> Option<&SequenceCursor> {
        self.cursors.get(position)
    }

    pub fn connections(&self, position: usize) -> Option<&Arc<ConnectionSet>> {
        self.connections.get(position).and_then(Option::as_ref)
    }

    /// Whether any predicate runs a script; such snapshots are resolved off
    /// the async workers.
    pub fn has_scripts(&self) -> bool {
        self.has_scripts
    }

    /// Rule names in evaluation order.
    pub fn names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }
}

/// Holder of the current snapshot.
#[derive(Debug)]
pub struct RuleStore {
    current: RwLock<Arc<Snapshot>>,
    versions: AtomicU64,
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::default())),
            versions: AtomicU64::new(0),
        }
    }

    pub fn load(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    /// Build a snapshot from compiled rules and make it current.
    pub fn install(&self, rules: Vec<Rule>) -> Arc<Snapshot> {
        let version = self.versions.fetch_add(1, Ordering::AcqRel) + 1;
        let snapshot = Arc::new(Snapshot::new(version, rules));
        *self.current.write() = snapshot.clone();
        snapshot
    }
}
