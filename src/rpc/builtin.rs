//! Builtin `setValue` / `getValue` handlers
//!
//! `setValue` stores whatever the platform sends as `params` and echoes it
//! back; `getValue` returns the last stored value (`null` before any set).

use super::registry::HandlerRegistry;
use super::{HandlerError, RpcHandler};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

pub const SET_VALUE_METHOD: &str = "setValue";
pub const GET_VALUE_METHOD: &str = "getValue";

/// Last value set by the platform, shared between both handlers
#[derive(Debug, Clone, Default)]
pub struct ValueStore {
    value: Arc<RwLock<Option<Value>>>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Value> {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Store `value`, returning the previous one
    pub fn set(&self, value: Value) -> Option<Value> {
        self.value
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(value)
    }
}

pub struct SetValueHandler {
    store: ValueStore,
}

impl SetValueHandler {
    pub fn new(store: ValueStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RpcHandler for SetValueHandler {
    async fn handle(&self, params: Value) -> Result<Value, HandlerError> {
        info!(value = %params, "VALUE SET");
        self.store.set(params.clone());
        Ok(json!({ "value": params }))
    }
}

pub struct GetValueHandler {
    store: ValueStore,
}

impl GetValueHandler {
    pub fn new(store: ValueStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RpcHandler for GetValueHandler {
    async fn handle(&self, _params: Value) -> Result<Value, HandlerError> {
        Ok(json!({ "value": self.store.get().unwrap_or(Value::Null) }))
    }
}

/// Register both builtin handlers on `registry`, backed by `store`
pub fn register_builtin_handlers(registry: &HandlerRegistry, store: &ValueStore) {
    registry.register(SET_VALUE_METHOD, Arc::new(SetValueHandler::new(store.clone())));
    registry.register(GET_VALUE_METHOD, Arc::new(GetValueHandler::new(store.clone())));
}
