//! Embedded scripting for match predicates, response generation and
//! streaming connections.
//!
//! Scripts are engine-agnostic at the seams: the rest of the crate only sees
//! [`ScriptRuntime`] and [`CompiledScript`]. Every invocation gets a fresh
//! interpreter; the only thing shared between invocations is [`GlobalState`].
//!
//! Scripts are not preemptible. A script that never returns pins the blocking
//! thread it runs on; operators own the scripts they load.

mod rhai_runtime;
mod state;

pub use rhai_runtime::RhaiRuntime;
pub use state::GlobalState;

use crate::error::ScriptError;
use crate::request::RequestView;
use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Script compiled by a [`ScriptRuntime`]. Cheap to clone.
#[derive(Clone)]
pub struct CompiledScript {
    source: Arc<str>,
    handle: Arc<dyn Any + Send + Sync>,
}

impl CompiledScript {
    pub fn new(source: &str, handle: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            source: Arc::from(source),
            handle,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Engine-specific compiled form.
    pub fn handle<T: Any>(&self) -> Option<&T> {
        self.handle.downcast_ref::<T>()
    }
}

impl fmt::Debug for CompiledScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledScript")
            .field("source_len", &self.source.len())
            .finish()
    }
}

/// Response produced by a script. Returned to the client verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseOverride {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Outcome of a match script.
#[derive(Debug, Clone, Default)]
pub struct MatchResult {
    pub matches: bool,
    pub response: Option<ResponseOverride>,
}

/// Output of a streaming script, consumed by the connection loop.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamCommand {
    /// Text frame (WebSocket) or unnamed `data:` event (SSE)
    Text(String),
    /// Named SSE event
    Event {
        event: Option<String>,
        data: String,
        id: Option<String>,
    },
    Close,
}

/// Channels joining a streaming script to its connection.
pub struct StreamContext {
    pub outbound: mpsc::Sender<StreamCommand>,
    /// Inbound messages; only WebSocket connections have them
    pub inbound: Option<mpsc::Receiver<String>>,
}

/// Something that can compile and run embedded scripts.
///
/// All `evaluate_*` / `run_*` methods block; callers run them on
/// `spawn_blocking` threads.
pub trait ScriptRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    /// Compile a script, reporting syntax errors.
    fn compile(&self, source: &str) -> Result<CompiledScript, ScriptError>;

    /// Run a match script. It must return a map with a boolean `matches`
    /// and optionally a `response` map.
    fn evaluate_match(
        &self,
        script: &CompiledScript,
        request: &RequestView,
        state: &GlobalState,
    ) -> Result<MatchResult, ScriptError>;

    /// Run a response script. Returning nothing keeps the configured response.
    fn generate_response(
        &self,
        script: &CompiledScript,
        request: &RequestView,
        state: &GlobalState,
    ) -> Result<Option<ResponseOverride>, ScriptError>;

    /// Run a script for the lifetime of one streaming connection.
    fn run_stream(
        &self,
        script: &CompiledScript,
        request: &RequestView,
        state: &GlobalState,
        context: StreamContext,
    ) -> Result<(), ScriptError>;
}

/// Script runtime used when none is configured explicitly.
pub fn default_runtime() -> Arc<dyn ScriptRuntime> {
    Arc::new(RhaiRuntime::new())
}
