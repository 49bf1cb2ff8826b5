//! Protocol kinds a rule can serve.

use serde::{Deserialize, Serialize};

/// Transport a rule answers on once it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain request/response HTTP
    #[default]
    Http,
    /// WebSocket upgrade
    #[serde(alias = "ws")]
    WebSocket,
    /// Server-Sent Events stream
    Sse,
}
