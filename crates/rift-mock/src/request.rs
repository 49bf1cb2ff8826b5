//! Transport-independent view of an inbound request.
//!
//! Everything downstream of the server (predicates, scripts, templates,
//! callbacks) reads requests through [`RequestView`].

use bytes::Bytes;
use once_cell::sync::OnceCell;
use serde_json::{json, Map, Value};
use std::borrow::Cow;
use std::collections::HashMap;
use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub struct RequestView {
    pub method: String,
    /// Full request target, query string included
    pub uri: String,
    /// Path component only
    pub path: String,
    pub query: HashMap<String, String>,
    /// Headers in arrival order, names lowercased
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub remote_addr: Option<SocketAddr>,
    json: OnceCell<Option<Value>>,
}

impl RequestView {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        let (path, query_string) = match uri.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query)),
            None => (uri.clone(), None),
        };
        let query = parse_query_string(query_string);
        Self {
            method: method.into(),
            uri,
            path,
            query,
            headers: Vec::new(),
            body: Bytes::new(),
            remote_addr: None,
            json: OnceCell::new(),
        }
    }

    /// Build a view from hyper request parts.
    pub fn from_parts(
        parts: &hyper::http::request::Parts,
        body: Bytes,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string());
        let mut view = Self::new(parts.method.as_str(), uri);
        view.headers = parts
            .headers
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|val| (k.as_str().to_lowercase(), val.to_string()))
            })
            .collect();
        view.body = body;
        view.remote_addr = remote_addr;
        view
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_lowercase(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.json = OnceCell::new();
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// First value of a header, looked up case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Body parsed as JSON, or None when it is not valid JSON. Parsed once.
    pub fn json(&self) -> Option<&Value> {
        self.json
            .get_or_init(|| serde_json::from_slice(&self.body).ok())
            .as_ref()
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }

    /// The request as a JSON object, as seen by scripts and templates.
    pub fn to_context(&self) -> Value {
        let mut headers = Map::new();
        for (name, value) in &self.headers {
            headers
                .entry(name.clone())
                .or_insert_with(|| Value::String(value.clone()));
        }
        json!({
            "method": self.method,
            "uri": self.uri,
            "path": self.path,
            "query": self.query,
            "headers": headers,
            "body": self.body_text(),
            "json": self.json().cloned().unwrap_or(Value::Null),
            "remoteAddr": self.remote_addr.map(|a| a.to_string()).unwrap_or_default(),
        })
    }
}

/// Parse a query string into decoded key/value pairs. Later keys win.
pub fn parse_query_string(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if let Some(q) = query {
        for pair in q.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                let decoded = urlencoding::decode(value).unwrap_or_default().to_string();
                params.insert(key.to_string(), decoded);
            } else if !pair.is_empty() {
                params.insert(pair.to_string(), String::new());
            }
        }
    }
    params
}
