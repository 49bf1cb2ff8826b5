//! WebSocket connections.
//!
//! The transport performs the upgrade and hands the resulting stream to
//! [`serve`]. Broadcast rules reserve their connection slot with [`admit`]
//! before upgrading so a full rule can be refused with a plain HTTP error.

use super::message_text;
use crate::config::WebSocketMode;
use crate::request::RequestView;
use crate::rule::WebSocketSpec;
use crate::scripting::{GlobalState, ScriptRuntime, StreamCommand, StreamContext};
use crate::store::{ConnectionSet, Membership};
use crate::template::TemplateEngine;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// Inbound messages buffered for a script before the reader waits.
const INBOUND_CAPACITY: usize = 64;
const OUTBOUND_CAPACITY: usize = 64;

/// A connection slot granted before the upgrade.
pub enum Admission {
    Open,
    Broadcast {
        membership: Membership,
        inbox: mpsc::UnboundedReceiver<Message>,
    },
}

/// Reserve a slot for a connection to a rule. `None` when a broadcast rule
/// is already at `max_connections`.
pub fn admit(spec: &WebSocketSpec, connections: Option<&Arc<ConnectionSet>>) -> Option<Admission> {
    match (spec.mode(), connections) {
        (WebSocketMode::Broadcast, Some(set)) => set
            .join(spec.config.max_connections)
            .map(|(membership, inbox)| Admission::Broadcast { membership, inbox }),
        _ => Some(Admission::Open),
    }
}

/// Everything a connection needs, owned by the connection task.
pub struct WsSession {
    pub rule: String,
    pub spec: WebSocketSpec,
    pub request: RequestView,
    pub templates: Arc<TemplateEngine>,
    pub runtime: Arc<dyn ScriptRuntime>,
    pub state: GlobalState,
}

/// Drive one upgraded connection until either side closes it.
pub async fn serve<S>(session: WsSession, admission: Admission, ws: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let rule = session.rule.clone();
    debug!("WebSocket connection opened for rule '{}'", rule);
    let result = match (session.spec.mode(), admission) {
        (WebSocketMode::Broadcast, Admission::Broadcast { membership, inbox }) => {
            broadcast(ws, membership, inbox).await
        }
        (WebSocketMode::Sequence, _) => sequence(&session, ws).await,
        (WebSocketMode::Script, _) => script(session, ws).await,
        _ => echo(ws).await,
    };
    match result {
        Ok(()) => debug!("WebSocket connection closed for rule '{}'", rule),
        Err(e) => debug!("WebSocket connection for rule '{}' ended: {}", rule, e),
    }
}

type WsResult = Result<(), tokio_tungstenite::tungstenite::Error>;

async fn echo<S>(mut ws: WebSocketStream<S>) -> WsResult
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = ws.next().await {
        match message? {
            message @ (Message::Text(_) | Message::Binary(_)) => ws.send(message).await?,
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

async fn sequence<S>(session: &WsSession, mut ws: WebSocketStream<S>) -> WsResult
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = &session.spec.config;
    let context = TemplateEngine::context(&session.request);
    let interval = Duration::from_millis(config.interval_ms);

    let total = match config.max_messages {
        Some(max) if !config.messages.is_empty() => max,
        _ => config.messages.len(),
    };
    for (sent, message) in config.messages.iter().cycle().take(total).enumerate() {
        if sent > 0 && !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
        if message.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(message.delay_ms)).await;
        }
        let text = message_text(
            &session.templates,
            &message.data,
            message.template || config.template,
            &context,
        );
        ws.send(Message::Text(text)).await?;
    }

    // Keep the connection until the client is done
    while let Some(message) = ws.next().await {
        if matches!(message?, Message::Close(_)) {
            break;
        }
    }
    Ok(())
}

async fn broadcast<S>(
    ws: WebSocketStream<S>,
    membership: Membership,
    mut inbox: mpsc::UnboundedReceiver<Message>,
) -> WsResult
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                    let reached = membership.broadcast(&message);
                    debug!("Broadcast from connection {} reached {} peers", membership.id(), reached);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
            },
            outgoing = inbox.recv() => match outgoing {
                Some(message) => sink.send(message).await?,
                None => break,
            },
        }
    }
    Ok(())
}

async fn script<S>(session: WsSession, ws: WebSocketStream<S>) -> WsResult
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Some(compiled) = session.spec.script.clone() else {
        return Ok(());
    };
    let (mut sink, mut stream) = ws.split();
    let (in_tx, in_rx) = mpsc::channel::<String>(INBOUND_CAPACITY);
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<StreamCommand>(OUTBOUND_CAPACITY);

    let mut reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(data)) => String::from_utf8_lossy(&data).into_owned(),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            if in_tx.send(text).await.is_err() {
                break;
            }
        }
    });

    let runtime = session.runtime.clone();
    let state = session.state.clone();
    let request = session.request.clone();
    let rule = session.rule.clone();
    let script_task = tokio::task::spawn_blocking(move || {
        let context = StreamContext {
            outbound: cmd_tx,
            inbound: Some(in_rx),
        };
        if let Err(e) = runtime.run_stream(&compiled, &request, &state, context) {
            warn!("WebSocket script for rule '{}' failed: {}", rule, e);
        }
    });

    let mut reader_done = false;
    let result = loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(StreamCommand::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        break Err(e);
                    }
                }
                Some(StreamCommand::Event { data, .. }) => {
                    if let Err(e) = sink.send(Message::Text(data)).await {
                        break Err(e);
                    }
                }
                Some(StreamCommand::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break Ok(());
                }
            },
            _ = &mut reader, if !reader_done => {
                // Client went away; let the script notice on its next send
                reader_done = true;
                break Ok(());
            },
        }
    };

    drop(cmd_rx);
    if !reader_done {
        reader.abort();
    }
    let _ = script_task.await;
    result
}
