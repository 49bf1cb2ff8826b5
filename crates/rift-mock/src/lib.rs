//! Rift mock: a programmable HTTP/WebSocket/SSE simulation server.
//!
//! Rules are loaded from YAML, compiled into immutable snapshots and matched
//! in priority order. Matched rules produce responses that can be sequenced,
//! delayed, templated, scripted, or deliberately broken by chaos injection.
//! Rule files are reloaded live without disturbing requests in flight.

pub mod callback;
pub mod config;
pub mod engine;
pub mod error;
pub mod loader;
pub mod observe;
pub mod predicate;
pub mod random;
pub mod reload;
pub mod request;
pub mod resolver;
pub mod rule;
pub mod scripting;
pub mod server;
pub mod store;
pub mod streaming;
pub mod synth;
pub mod template;

pub use config::{RuleDefinition, ServerConfig};
pub use engine::{EngineOptions, Matched, MockEngine};
pub use error::{ConfigError, LoadError, RuleError, ScriptError, ValidationReport};
pub use loader::{RuleSource, StaticSource, YamlDirectorySource};
pub use request::RequestView;
pub use synth::ResponseOutcome;
