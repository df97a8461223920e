use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;

use crate::constraints::Constraints;

#[derive(Debug, Clone, PartialEq)]
pub struct ConstrainedValue {
    pub constraints: Constraints,
    pub value: Value,
}

impl ConstrainedValue {
    pub fn new(constraints: Constraints, value: impl Into<Value>) -> Self {
        Self {
            constraints,
            value: value.into(),
        }
    }

    pub fn global(value: impl Into<Value>) -> Self {
        Self::new(Constraints::global(), value)
    }
}

/// Source of raw configured values.
pub trait Client: Send + Sync {
    fn get_value(&self, key: &str) -> Vec<ConstrainedValue>;
}

/// Client backed by an in-process map. Values can be replaced at runtime.
#[derive(Debug, Default)]
pub struct StaticClient {
    values: RwLock<HashMap<String, Vec<ConstrainedValue>>>,
}

impl StaticClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, values: Vec<ConstrainedValue>) {
        let mut map = self.values.write().unwrap_or_else(|e| e.into_inner());
        map.insert(key.into(), values);
    }

    pub fn remove(&self, key: &str) {
        let mut map = self.values.write().unwrap_or_else(|e| e.into_inner());
        map.remove(key);
    }
}

impl Client for StaticClient {
    fn get_value(&self, key: &str) -> Vec<ConstrainedValue> {
        let map = self.values.read().unwrap_or_else(|e| e.into_inner());
        map.get(key).cloned().unwrap_or_default()
    }
}
