use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Process-wide key/value store shared by every script.
///
/// Created once and handed to the engine; reloads never reset it. All
/// read-modify-write operations run under a single lock so concurrent scripts
/// cannot lose updates.
#[derive(Debug, Clone, Default)]
pub struct GlobalState {
    data: Arc<Mutex<HashMap<String, Value>>>,
}

impl GlobalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.data.lock().insert(key.into(), value);
    }

    pub fn has(&self, key: &str) -> bool {
        self.data.lock().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.data.lock().remove(key)
    }

    /// Add `by` to a numeric value and return the result. Missing or
    /// non-integer values start from 0.
    pub fn increment(&self, key: &str, by: i64) -> i64 {
        let mut data = self.data.lock();
        let current = data.get(key).and_then(Value::as_i64).unwrap_or(0);
        let next = current.saturating_add(by);
        data.insert(key.to_string(), Value::from(next));
        next
    }

    /// Append to a list, creating it when missing. A non-list value is
    /// replaced. Returns the new length.
    pub fn push(&self, key: &str, value: Value) -> usize {
        let mut data = self.data.lock();
        let entry = data
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !entry.is_array() {
            *entry = Value::Array(Vec::new());
        }
        match entry {
            Value::Array(items) => {
                items.push(value);
                items.len()
            }
            _ => 0,
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}
