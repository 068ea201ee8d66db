//! Method name to handler mapping

use super::{RpcError, RpcHandler};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Thread-safe handler registry. The last registration for a method wins.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn RpcHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method`; returns true when it replaced one
    pub fn register(&self, method: impl Into<String>, handler: Arc<dyn RpcHandler>) -> bool {
        let method = method.into();
        debug!(%method, "Registering RPC handler");
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method, handler)
            .is_some()
    }

    pub fn unregister(&self, method: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(method)
            .is_some()
    }

    pub fn resolve(&self, method: &str) -> Result<Arc<dyn RpcHandler>, RpcError> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
            .ok_or_else(|| RpcError::MethodNotFound(method.to_string()))
    }

    /// Registered method names, sorted
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        methods.sort();
        methods
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
