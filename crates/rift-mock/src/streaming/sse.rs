//! Server-Sent Events.
//!
//! [`open`] spawns a producer task and returns the receiving end of the
//! event stream; the transport turns it into a `text/event-stream` body.
//! The producer stops as soon as the client goes away.

use super::message_text;
use crate::config::{EventConfig, SseMode};
use crate::request::RequestView;
use crate::rule::SseSpec;
use crate::scripting::{GlobalState, ScriptRuntime, StreamCommand, StreamContext};
use crate::template::TemplateEngine;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 32;
const KEEP_ALIVE_FRAME: &str = ": keep-alive\n\n";

/// Everything an SSE stream needs, owned so the producer can outlive the
/// request handler.
pub struct SseSession {
    pub rule: String,
    pub spec: SseSpec,
    pub request: RequestView,
    pub templates: Arc<TemplateEngine>,
    pub runtime: Arc<dyn ScriptRuntime>,
    pub state: GlobalState,
}

/// Encode one event. Multi-line data becomes several `data:` lines.
pub fn format_event(
    event: Option<&str>,
    data: &str,
    id: Option<&str>,
    retry_ms: Option<u64>,
) -> String {
    let mut frame = String::new();
    if let Some(id) = id {
        frame.push_str(&format!("id: {id}\n"));
    }
    if let Some(event) = event {
        frame.push_str(&format!("event: {event}\n"));
    }
    if let Some(retry) = retry_ms {
        frame.push_str(&format!("retry: {retry}\n"));
    }
    if data.is_empty() {
        frame.push_str("data: \n");
    }
    for line in data.lines() {
        frame.push_str(&format!("data: {line}\n"));
    }
    frame.push('\n');
    frame
}

/// Start producing events for `session`.
pub fn open(session: SseSession) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let rule = session.rule.clone();
        match session.spec.mode() {
            SseMode::Once => stream_events(&session, &tx, false).await,
            SseMode::Cycle => stream_events(&session, &tx, true).await,
            SseMode::Script => run_script(session, tx).await,
        }
        debug!("SSE stream for rule '{}' finished", rule);
    });
    rx
}

async fn stream_events(session: &SseSession, tx: &mpsc::Sender<Bytes>, repeat: bool) {
    let config = &session.spec.config;
    let context = TemplateEngine::context(&session.request);
    let interval = Duration::from_millis(config.interval_ms);
    let keep_alive = config.keep_alive_ms.map(Duration::from_millis);

    let mut first = true;
    loop {
        for event in &config.events {
            if !first && pause(tx, interval, keep_alive).await.is_err() {
                return;
            }
            first = false;
            if pause(tx, Duration::from_millis(event.delay_ms), keep_alive)
                .await
                .is_err()
            {
                return;
            }
            let frame = render_event(session, event, &context);
            if tx.send(Bytes::from(frame)).await.is_err() {
                return;
            }
        }
        if !repeat || config.events.is_empty() {
            return;
        }
    }
}

fn render_event(session: &SseSession, event: &EventConfig, context: &Value) -> String {
    let data = message_text(
        &session.templates,
        &event.data,
        session.spec.config.template,
        context,
    );
    format_event(
        event.event.as_deref(),
        &data,
        event.id.as_deref(),
        event.retry_ms,
    )
}

/// Wait `total`, emitting keep-alive comments every `keep_alive`. Errs once
/// the client is gone.
async fn pause(
    tx: &mpsc::Sender<Bytes>,
    total: Duration,
    keep_alive: Option<Duration>,
) -> Result<(), ()> {
    let mut remaining = total;
    while !remaining.is_zero() {
        let step = match keep_alive {
            Some(every) if !every.is_zero() && every < remaining => every,
            _ => remaining,
        };
        tokio::time::sleep(step).await;
        remaining -= step;
        if !remaining.is_zero() {
            tx.send(Bytes::from_static(KEEP_ALIVE_FRAME.as_bytes()))
                .await
                .map_err(|_| ())?;
        }
    }
    if tx.is_closed() {
        return Err(());
    }
    Ok(())
}

async fn run_script(session: SseSession, tx: mpsc::Sender<Bytes>) {
    let Some(script) = session.spec.script.clone() else {
        return;
    };
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<StreamCommand>(CHANNEL_CAPACITY);
    let runtime = session.runtime.clone();
    let state = session.state.clone();
    let request = session.request.clone();
    let rule = session.rule.clone();

    let script_task = tokio::task::spawn_blocking(move || {
        let context = StreamContext {
            outbound: cmd_tx,
            inbound: None,
        };
        if let Err(e) = runtime.run_stream(&script, &request, &state, context) {
            warn!("SSE script for rule '{}' failed: {}", rule, e);
        }
    });

    while let Some(command) = cmd_rx.recv().await {
        let frame = match command {
            StreamCommand::Text(data) => format_event(None, &data, None, None),
            StreamCommand::Event { event, data, id } => {
                format_event(event.as_deref(), &data, id.as_deref(), None)
            }
            StreamCommand::Close => break,
        };
        if tx.send(Bytes::from(frame)).await.is_err() {
            break;
        }
    }
    // Further sends from the script now fail and mark the connection closed
    drop(cmd_rx);
    let _ = script_task.await;
}
