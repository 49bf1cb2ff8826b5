//! HTTP/1.1 transport.
//!
//! One task per connection. Plain HTTP rules are answered through
//! [`MockEngine::handle_request`]'s pipeline, WebSocket rules are upgraded in
//! place and SSE rules get a streaming body.

use crate::config::Protocol;
use crate::engine::{Matched, MockEngine};
use crate::request::RequestView;
use crate::streaming::sse::{self, SseSession};
use crate::streaming::websocket::{self, WsSession};
use crate::synth::ResponseOutcome;
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

pub type ResponseBody = UnsyncBoxBody<Bytes, Infallible>;

/// Accept connections until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    engine: Arc<MockEngine>,
    shutdown: impl Future<Output = ()>,
) {
    match listener.local_addr() {
        Ok(addr) => info!("Mock server listening on {}", addr),
        Err(e) => warn!("Mock server listening on unknown address: {}", e),
    }
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let engine = Arc::clone(&engine);
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let engine = Arc::clone(&engine);
                                async move { handle(req, engine, addr).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .with_upgrades()
                                .await
                            {
                                debug!("Connection error from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Mock server shutting down");
                break;
            }
        }
    }
}

async fn handle(
    mut req: Request<Incoming>,
    engine: Arc<MockEngine>,
    remote: SocketAddr,
) -> Result<Response<ResponseBody>, Infallible> {
    let started = Instant::now();
    let on_upgrade = hyper::upgrade::on(&mut req);
    let (parts, body) = req.into_parts();

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("Failed to read request body from {}: {}", remote, e);
            return Ok(json_error(StatusCode::BAD_REQUEST, "failed to read request body"));
        }
    };
    let request = RequestView::from_parts(&parts, body, Some(remote));

    let Some(matched) = engine.resolve(&request).await else {
        engine.no_match(&request, started);
        return Ok(not_found(&request));
    };

    let response = match matched.rule().protocol {
        Protocol::Http => {
            let outcome = engine.respond(&matched, &request, started).await;
            outcome_response(outcome)
        }
        Protocol::WebSocket => upgrade_websocket(&engine, matched, request, on_upgrade, started),
        Protocol::Sse => open_sse(&engine, matched, request, started),
    };
    Ok(response)
}

fn upgrade_websocket(
    engine: &Arc<MockEngine>,
    matched: Matched,
    request: RequestView,
    on_upgrade: hyper::upgrade::OnUpgrade,
    started: Instant,
) -> Response<ResponseBody> {
    let rule = matched.rule().clone();
    let Some(spec) = rule.websocket.clone() else {
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, "rule has no websocket config");
    };
    let key = match request.header("sec-websocket-key") {
        Some(key) if request.is_websocket_upgrade() => key.to_string(),
        _ => {
            engine.record(&request, Some(rule.name()), 400, false, started);
            return json_error(StatusCode::BAD_REQUEST, "websocket upgrade required");
        }
    };
    let Some(admission) = websocket::admit(&spec, matched.connections()) else {
        warn!("Rule '{}' is at its connection limit", rule.name());
        engine.record(&request, Some(rule.name()), 503, false, started);
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "connection limit reached");
    };

    engine.observer().on_match(rule.name());
    engine.record(&request, Some(rule.name()), 101, false, started);

    let session = WsSession {
        rule: rule.name().to_string(),
        spec,
        request,
        templates: engine.templates().clone(),
        runtime: engine.runtime().clone(),
        state: engine.state().clone(),
    };
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let ws =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                        .await;
                websocket::serve(session, admission, ws).await;
            }
            Err(e) => warn!("WebSocket upgrade failed: {}", e),
        }
    });

    let mut response = Response::new(empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(hyper::header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(hyper::header::UPGRADE, HeaderValue::from_static("websocket"));
    if let Ok(accept) = HeaderValue::from_str(&derive_accept_key(key.as_bytes())) {
        headers.insert(hyper::header::SEC_WEBSOCKET_ACCEPT, accept);
    }
    response
}

fn open_sse(
    engine: &Arc<MockEngine>,
    matched: Matched,
    request: RequestView,
    started: Instant,
) -> Response<ResponseBody> {
    let rule = matched.rule().clone();
    let Some(spec) = rule.sse.clone() else {
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, "rule has no sse config");
    };
    engine.observer().on_match(rule.name());
    engine.record(&request, Some(rule.name()), 200, false, started);

    let events = sse::open(SseSession {
        rule: rule.name().to_string(),
        spec,
        request,
        templates: engine.templates().clone(),
        runtime: engine.runtime().clone(),
        state: engine.state().clone(),
    });

    let mut response = Response::new(stream_body(events));
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(hyper::header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn stream_body(rx: mpsc::Receiver<Bytes>) -> ResponseBody {
    let frames = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|bytes| (Ok::<_, Infallible>(Frame::data(bytes)), rx))
    });
    StreamBody::new(frames).boxed_unsync()
}

fn full(body: impl Into<Bytes>) -> ResponseBody {
    Full::new(body.into()).boxed_unsync()
}

fn empty() -> ResponseBody {
    full(Bytes::new())
}

/// Convert a synthesized outcome. Headers that are not valid HTTP are
/// dropped with a warning.
pub fn outcome_response(outcome: ResponseOutcome) -> Response<ResponseBody> {
    let status = StatusCode::from_u16(outcome.status).unwrap_or_else(|_| {
        warn!("Rule '{}' produced invalid status {}", outcome.rule, outcome.status);
        StatusCode::INTERNAL_SERVER_ERROR
    });
    let mut response = Response::new(full(outcome.body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, value) in &outcome.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!("Rule '{}' produced invalid header '{}'", outcome.rule, name),
        }
    }
    response
}

fn json_error(status: StatusCode, message: &str) -> Response<ResponseBody> {
    let body = serde_json::json!({ "error": message }).to_string();
    json_response(status, body)
}

fn not_found(request: &RequestView) -> Response<ResponseBody> {
    let body = serde_json::json!({
        "error": "no rule matched",
        "method": request.method,
        "uri": request.uri,
    })
    .to_string();
    json_response(StatusCode::NOT_FOUND, body)
}

fn json_response(status: StatusCode, body: String) -> Response<ResponseBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
