//! Streaming protocol adapters.
//!
//! Both adapters start from a request the engine already resolved and read
//! the matched rule's protocol-specific configuration.

pub mod sse;
pub mod websocket;

use crate::config::BodyConfig;
use crate::rule::render_body;
use crate::template::TemplateEngine;
use serde_json::Value;

/// Text of a configured message, templated when asked to.
fn message_text(
    templates: &TemplateEngine,
    data: &BodyConfig,
    template: bool,
    context: &Value,
) -> String {
    let text = render_body(data);
    if template {
        templates.render(&text, context)
    } else {
        text
    }
}
