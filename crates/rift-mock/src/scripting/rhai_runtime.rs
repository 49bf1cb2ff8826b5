use super::{
    CompiledScript, GlobalState, MatchResult, ResponseOverride, ScriptRuntime, StreamCommand,
    StreamContext,
};
use crate::error::ScriptError;
use crate::request::RequestView;
use bytes::Bytes;
use parking_lot::Mutex;
use rhai::{Array, Dynamic, Engine, FnPtr, Map, Scope, AST};
use serde_json::Value;
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Rhai-backed [`ScriptRuntime`].
///
/// Scripts see `request` (read-only map), `state`, `console` and, on streaming
/// connections, `conn`, `onMessage(fn)` and `sleep(ms)`.
#[derive(Debug, Clone, Default)]
pub struct RhaiRuntime;

impl RhaiRuntime {
    pub fn new() -> Self {
        Self
    }

    fn create_engine() -> Engine {
        let mut engine = Engine::new();

        engine.on_print(|text| info!(target: "rift_mock::script", "{}", text));
        engine.on_debug(|text, source, pos| {
            debug!(
                target: "rift_mock::script",
                "{} @ {}: {}",
                source.unwrap_or("script"),
                pos,
                text
            )
        });

        engine
            .register_type_with_name::<ScriptState>("State")
            .register_fn("get", ScriptState::get)
            .register_fn("set", ScriptState::set)
            .register_fn("has", ScriptState::has)
            .register_fn("remove", ScriptState::remove)
            .register_fn("increment", ScriptState::increment)
            .register_fn("increment", ScriptState::increment_by)
            .register_fn("push", ScriptState::push)
            .register_fn("keys", ScriptState::keys);

        engine
            .register_type_with_name::<ScriptConsole>("Console")
            .register_fn("log", ScriptConsole::log)
            .register_fn("info", ScriptConsole::log)
            .register_fn("warn", ScriptConsole::warn)
            .register_fn("error", ScriptConsole::error);

        engine
    }

    fn base_scope(request: &RequestView, state: &GlobalState) -> Scope<'static> {
        let mut scope = Scope::new();
        scope.push_constant("request", json_to_dynamic(request.to_context()));
        scope.push("state", ScriptState::new(state.clone()));
        scope.push("console", ScriptConsole);
        scope
    }

    fn ast<'a>(engine: &Engine, script: &'a CompiledScript) -> Result<Cow<'a, AST>, ScriptError> {
        match script.handle::<AST>() {
            Some(ast) => Ok(Cow::Borrowed(ast)),
            None => engine
                .compile(script.source())
                .map(Cow::Owned)
                .map_err(|e| ScriptError::Compile(e.to_string())),
        }
    }

    fn run(
        engine: &Engine,
        scope: &mut Scope,
        ast: &AST,
    ) -> Result<Dynamic, ScriptError> {
        engine
            .eval_ast_with_scope::<Dynamic>(scope, ast)
            .map_err(|e| ScriptError::Runtime(e.to_string()))
    }
}

impl ScriptRuntime for RhaiRuntime {
    fn name(&self) -> &'static str {
        "rhai"
    }

    fn compile(&self, source: &str) -> Result<CompiledScript, ScriptError> {
        let engine = Self::create_engine();
        let ast = engine
            .compile(source)
            .map_err(|e| ScriptError::Compile(e.to_string()))?;
        Ok(CompiledScript::new(source, Arc::new(ast)))
    }

    fn evaluate_match(
        &self,
        script: &CompiledScript,
        request: &RequestView,
        state: &GlobalState,
    ) -> Result<MatchResult, ScriptError> {
        let engine = Self::create_engine();
        let ast = Self::ast(&engine, script)?;
        let mut scope = Self::base_scope(request, state);
        let result = Self::run(&engine, &mut scope, &ast)?;
        parse_match_result(result)
    }

    fn generate_response(
        &self,
        script: &CompiledScript,
        request: &RequestView,
        state: &GlobalState,
    ) -> Result<Option<ResponseOverride>, ScriptError> {
        let engine = Self::create_engine();
        let ast = Self::ast(&engine, script)?;
        let mut scope = Self::base_scope(request, state);
        let result = Self::run(&engine, &mut scope, &ast)?;
        if result.is_unit() {
            return Ok(None);
        }
        let map = result
            .try_cast::<Map>()
            .ok_or_else(|| ScriptError::InvalidResult("response script must return a map".into()))?;
        parse_response(map).map(Some)
    }

    fn run_stream(
        &self,
        script: &CompiledScript,
        request: &RequestView,
        state: &GlobalState,
        context: StreamContext,
    ) -> Result<(), ScriptError> {
        let mut engine = Self::create_engine();
        let handler: Arc<Mutex<Option<FnPtr>>> = Arc::new(Mutex::new(None));
        let conn = ScriptConnection::new(context.outbound);

        engine
            .register_type_with_name::<ScriptConnection>("Connection")
            .register_fn("send", ScriptConnection::send)
            .register_fn("sendJSON", ScriptConnection::send_json)
            .register_fn("sendEvent", ScriptConnection::send_event)
            .register_fn("sendEvent", ScriptConnection::send_named_event)
            .register_fn("close", ScriptConnection::close)
            .register_fn("isClosed", ScriptConnection::is_closed);

        let slot = handler.clone();
        engine.register_fn("onMessage", move |callback: FnPtr| {
            *slot.lock() = Some(callback);
        });
        engine.register_fn("sleep", |ms: i64| {
            std::thread::sleep(Duration::from_millis(ms.max(0) as u64));
        });

        let ast = Self::ast(&engine, script)?;
        let mut scope = Self::base_scope(request, state);
        scope.push("conn", conn.clone());
        let _ = Self::run(&engine, &mut scope, &ast)?;

        let callback = handler.lock().take();
        if let (Some(callback), Some(mut inbound)) = (callback, context.inbound) {
            while !conn.closed.load(Ordering::Acquire) {
                let Some(message) = inbound.blocking_recv() else {
                    break;
                };
                if let Err(e) = callback.call::<Dynamic>(&engine, &ast, (message,)) {
                    warn!("onMessage handler failed: {}", e);
                }
            }
        }
        Ok(())
    }
}

fn parse_match_result(result: Dynamic) -> Result<MatchResult, ScriptError> {
    if let Ok(matches) = result.as_bool() {
        return Ok(MatchResult {
            matches,
            response: None,
        });
    }

    let map = result.try_cast::<Map>().ok_or_else(|| {
        ScriptError::InvalidResult("match script must return a map with 'matches'".into())
    })?;

    let matches = map
        .get("matches")
        .and_then(|v| v.as_bool().ok())
        .ok_or_else(|| ScriptError::InvalidResult("missing boolean 'matches'".into()))?;

    let response = match map.get("response") {
        Some(value) if !value.is_unit() => {
            let response = value.clone().try_cast::<Map>().ok_or_else(|| {
                ScriptError::InvalidResult("'response' must be a map".into())
            })?;
            Some(parse_response(response)?)
        }
        _ => None,
    };

    Ok(MatchResult { matches, response })
}

fn parse_response(map: Map) -> Result<ResponseOverride, ScriptError> {
    let status = match map.get("status") {
        Some(v) => {
            let code = v
                .as_int()
                .map_err(|_| ScriptError::InvalidResult("'status' must be an integer".into()))?;
            if !(100..=999).contains(&code) {
                return Err(ScriptError::InvalidResult(format!(
                    "status {code} is out of range"
                )));
            }
            code as u16
        }
        None => 200,
    };

    let mut headers = Vec::new();
    if let Some(headers_map) = map.get("headers").and_then(|v| v.clone().try_cast::<Map>()) {
        for (key, value) in headers_map {
            headers.push((key.to_string(), dynamic_to_text(value)));
        }
    }

    let body = match map.get("body") {
        None => Bytes::new(),
        Some(v) if v.is_unit() => Bytes::new(),
        Some(v) if v.is_map() || v.is_array() => {
            if !headers
                .iter()
                .any(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            {
                headers.push(("content-type".to_string(), "application/json".to_string()));
            }
            Bytes::from(dynamic_to_json(v.clone()).to_string())
        }
        Some(v) => Bytes::from(dynamic_to_text(v.clone())),
    };

    Ok(ResponseOverride {
        status,
        headers,
        body,
    })
}

fn dynamic_to_text(value: Dynamic) -> String {
    if let Some(s) = value.clone().try_cast::<String>() {
        s
    } else if value.is_map() || value.is_array() {
        dynamic_to_json(value).to_string()
    } else {
        format!("{value}")
    }
}

pub(crate) fn json_to_dynamic(value: Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::UNIT
            }
        }
        Value::String(s) => Dynamic::from(s),
        Value::Array(arr) => {
            let vec: Array = arr.into_iter().map(json_to_dynamic).collect();
            Dynamic::from(vec)
        }
        Value::Object(obj) => {
            let mut map = Map::new();
            for (k, v) in obj {
                map.insert(k.into(), json_to_dynamic(v));
            }
            Dynamic::from(map)
        }
    }
}

pub(crate) fn dynamic_to_json(value: Dynamic) -> Value {
    if value.is_unit() {
        Value::Null
    } else if let Ok(b) = value.as_bool() {
        Value::Bool(b)
    } else if let Ok(i) = value.as_int() {
        Value::Number(i.into())
    } else if let Ok(f) = value.as_float() {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    } else if let Some(s) = value.clone().try_cast::<String>() {
        Value::String(s)
    } else if let Some(arr) = value.clone().try_cast::<Array>() {
        Value::Array(arr.into_iter().map(dynamic_to_json).collect())
    } else if let Some(map) = value.clone().try_cast::<Map>() {
        let mut obj = serde_json::Map::new();
        for (k, v) in map {
            obj.insert(k.to_string(), dynamic_to_json(v));
        }
        Value::Object(obj)
    } else {
        Value::String(format!("{value}"))
    }
}

/// `state` as seen by scripts.
#[derive(Clone)]
struct ScriptState {
    state: GlobalState,
}

impl ScriptState {
    fn new(state: GlobalState) -> Self {
        Self { state }
    }

    fn get(&mut self, key: String) -> Dynamic {
        self.state
            .get(&key)
            .map(json_to_dynamic)
            .unwrap_or(Dynamic::UNIT)
    }

    fn set(&mut self, key: String, value: Dynamic) {
        self.state.set(key, dynamic_to_json(value));
    }

    fn has(&mut self, key: String) -> bool {
        self.state.has(&key)
    }

    fn remove(&mut self, key: String) -> Dynamic {
        self.state
            .remove(&key)
            .map(json_to_dynamic)
            .unwrap_or(Dynamic::UNIT)
    }

    fn increment(&mut self, key: String) -> i64 {
        self.state.increment(&key, 1)
    }

    fn increment_by(&mut self, key: String, by: i64) -> i64 {
        self.state.increment(&key, by)
    }

    fn push(&mut self, key: String, value: Dynamic) -> i64 {
        self.state.push(&key, dynamic_to_json(value)) as i64
    }

    fn keys(&mut self) -> Array {
        self.state.keys().into_iter().map(Dynamic::from).collect()
    }
}

/// `console` as seen by scripts; routed to tracing.
#[derive(Clone)]
struct ScriptConsole;

impl ScriptConsole {
    fn log(&mut self, message: Dynamic) {
        info!(target: "rift_mock::script", "{}", dynamic_to_text(message));
    }

    fn warn(&mut self, message: Dynamic) {
        warn!(target: "rift_mock::script", "{}", dynamic_to_text(message));
    }

    fn error(&mut self, message: Dynamic) {
        tracing::error!(target: "rift_mock::script", "{}", dynamic_to_text(message));
    }
}

/// `conn` as seen by streaming scripts.
///
/// Sends block the script thread while the connection's outbound buffer is
/// full. Every send after `close()` or after the peer is gone returns false.
#[derive(Clone)]
struct ScriptConnection {
    tx: mpsc::Sender<StreamCommand>,
    closed: Arc<AtomicBool>,
}

impl ScriptConnection {
    fn new(tx: mpsc::Sender<StreamCommand>) -> Self {
        Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn dispatch(&self, command: StreamCommand) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        if self.tx.blocking_send(command).is_err() {
            self.closed.store(true, Ordering::Release);
            return false;
        }
        true
    }

    fn send(&mut self, data: Dynamic) -> bool {
        self.dispatch(StreamCommand::Text(dynamic_to_text(data)))
    }

    fn send_json(&mut self, data: Dynamic) -> bool {
        self.dispatch(StreamCommand::Text(dynamic_to_json(data).to_string()))
    }

    /// `sendEvent(data)` or `sendEvent(#{event, data, id})`
    fn send_event(&mut self, data: Dynamic) -> bool {
        if let Some(map) = data.clone().try_cast::<Map>() {
            if let Some(payload) = map.get("data") {
                let event = map
                    .get("event")
                    .filter(|v| !v.is_unit())
                    .map(|v| dynamic_to_text(v.clone()));
                let id = map
                    .get("id")
                    .filter(|v| !v.is_unit())
                    .map(|v| dynamic_to_text(v.clone()));
                return self.dispatch(StreamCommand::Event {
                    event,
                    data: dynamic_to_text(payload.clone()),
                    id,
                });
            }
        }
        self.dispatch(StreamCommand::Event {
            event: None,
            data: dynamic_to_text(data),
            id: None,
        })
    }

    fn send_named_event(&mut self, event: String, data: Dynamic) -> bool {
        self.dispatch(StreamCommand::Event {
            event: Some(event),
            data: dynamic_to_text(data),
            id: None,
        })
    }

    fn close(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.blocking_send(StreamCommand::Close);
        }
    }

    fn is_closed(&mut self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(source: &str) -> CompiledScript {
        RhaiRuntime::new().compile(source).unwrap()
    }

    #[test]
    fn test_compile_error() {
        let err = RhaiRuntime::new().compile("let x = ;").unwrap_err();
        assert!(matches!(err, ScriptError::Compile(_)));
    }

    #[test]
    fn test_match_on_request_fields() {
        let script = compile(
            r#"
            #{ matches: request.method == "POST" && request.json.user.id == 5 }
            "#,
        );
        let runtime = RhaiRuntime::new();
        let state = GlobalState::new();

        let req = RequestView::new("POST", "/users").with_body(r#"{"user": {"id": 5}}"#);
        assert!(runtime.evaluate_match(&script, &req, &state).unwrap().matches);

        let req = RequestView::new("GET", "/users").with_body(r#"{"user": {"id": 5}}"#);
        assert!(!runtime.evaluate_match(&script, &req, &state).unwrap().matches);
    }

    #[test]
    fn test_match_with_response_override() {
        let script = compile(
            r#"
            let n = state.increment("calls");
            #{
                matches: true,
                response: #{
                    status: 202,
                    headers: #{ "x-call": n },
                    body: #{ calls: n }
                }
            }
            "#,
        );
        let runtime = RhaiRuntime::new();
        let state = GlobalState::new();
        let req = RequestView::new("GET", "/");

        let result = runtime.evaluate_match(&script, &req, &state).unwrap();
        let response = result.response.unwrap();
        assert_eq!(response.status, 202);
        assert!(response
            .headers
            .contains(&("x-call".to_string(), "1".to_string())));
        assert!(response
            .headers
            .contains(&("content-type".to_string(), "application/json".to_string())));
        let body: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body, json!({"calls": 1}));
        assert_eq!(state.get("calls"), Some(json!(1)));
    }

    #[test]
    fn test_invalid_match_result() {
        let runtime = RhaiRuntime::new();
        let state = GlobalState::new();
        let req = RequestView::new("GET", "/");

        let err = runtime
            .evaluate_match(&compile("42"), &req, &state)
            .unwrap_err();
        assert!(matches!(err, ScriptError::InvalidResult(_)));

        let err = runtime
            .evaluate_match(&compile("#{ other: 1 }"), &req, &state)
            .unwrap_err();
        assert!(matches!(err, ScriptError::InvalidResult(_)));
    }

    #[test]
    fn test_runtime_error_is_reported() {
        let runtime = RhaiRuntime::new();
        let err = runtime
            .evaluate_match(
                &compile("throw \"boom\";"),
                &RequestView::new("GET", "/"),
                &GlobalState::new(),
            )
            .unwrap_err();
        assert!(matches!(err, ScriptError::Runtime(_)));
    }

    #[test]
    fn test_request_is_read_only() {
        let runtime = RhaiRuntime::new();
        let result = runtime.evaluate_match(
            &compile(r#"request.method = "PUT"; #{ matches: true }"#),
            &RequestView::new("GET", "/"),
            &GlobalState::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_state_operations() {
        let runtime = RhaiRuntime::new();
        let state = GlobalState::new();
        let script = compile(
            r#"
            state.set("name", "rift");
            state.push("seen", request.path);
            state.increment("total", 10);
            let had = state.has("name");
            state.remove("name");
            #{ matches: had && !state.has("name") && state.keys().len() == 2 }
            "#,
        );
        let result = runtime
            .evaluate_match(&script, &RequestView::new("GET", "/a"), &state)
            .unwrap();
        assert!(result.matches);
        assert_eq!(state.get("seen"), Some(json!(["/a"])));
        assert_eq!(state.get("total"), Some(json!(10)));
    }

    #[test]
    fn test_generate_response() {
        let runtime = RhaiRuntime::new();
        let state = GlobalState::new();
        let req = RequestView::new("GET", "/orders/7");

        let script = compile(r#"#{ status: 201, body: "created " + request.path }"#);
        let response = runtime
            .generate_response(&script, &req, &state)
            .unwrap()
            .unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.body, Bytes::from("created /orders/7"));

        let script = compile("console.log(\"nothing to change\");");
        assert!(runtime
            .generate_response(&script, &req, &state)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_stream_script_sends_and_closes() {
        let runtime = RhaiRuntime::new();
        let (tx, mut rx) = mpsc::channel(16);
        let script = compile(
            r#"
            conn.send("hello");
            conn.sendJSON(#{ n: 1 });
            conn.sendEvent("tick", "1");
            conn.sendEvent(#{ event: "tock", data: "2", id: "7" });
            conn.close();
            conn.send("ignored");
            "#,
        );
        runtime
            .run_stream(
                &script,
                &RequestView::new("GET", "/events"),
                &GlobalState::new(),
                StreamContext {
                    outbound: tx,
                    inbound: None,
                },
            )
            .unwrap();

        assert_eq!(rx.try_recv().unwrap(), StreamCommand::Text("hello".into()));
        assert_eq!(rx.try_recv().unwrap(), StreamCommand::Text(r#"{"n":1}"#.into()));
        assert_eq!(
            rx.try_recv().unwrap(),
            StreamCommand::Event {
                event: Some("tick".into()),
                data: "1".into(),
                id: None
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            StreamCommand::Event {
                event: Some("tock".into()),
                data: "2".into(),
                id: Some("7".into())
            }
        );
        assert_eq!(rx.try_recv().unwrap(), StreamCommand::Close);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stream_script_on_message() {
        let runtime = RhaiRuntime::new();
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        in_tx.try_send("ping".to_string()).unwrap();
        in_tx.try_send("pong".to_string()).unwrap();
        drop(in_tx);

        let script = compile(
            r#"
            onMessage(|msg| {
                state.increment("messages");
                conn.send("echo: " + msg);
            });
            "#,
        );
        let state = GlobalState::new();
        runtime
            .run_stream(
                &script,
                &RequestView::new("GET", "/ws"),
                &state,
                StreamContext {
                    outbound: out_tx,
                    inbound: Some(in_rx),
                },
            )
            .unwrap();

        assert_eq!(
            out_rx.try_recv().unwrap(),
            StreamCommand::Text("echo: ping".into())
        );
        assert_eq!(
            out_rx.try_recv().unwrap(),
            StreamCommand::Text("echo: pong".into())
        );
        assert_eq!(state.get("messages"), Some(json!(2)));
    }
}
