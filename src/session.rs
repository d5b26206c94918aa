//! Per-connection session state.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

/// A concurrency-safe string-keyed attribute bag whose lifetime equals the
/// connection. Middleware uses it to pass facts down the chain (the auth
/// middleware store the authenticated `userid` here).
///
/// No ordering is guaranteed between concurrent writers.
#[derive(Debug, Default)]
pub struct Session {
    data: Mutex<HashMap<String, Value>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.lock().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.lock().unwrap().insert(key.into(), value.into());
    }

    pub fn delete(&self, key: &str) -> Option<Value> {
        self.data.lock().unwrap().remove(key)
    }
}
