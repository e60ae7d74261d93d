//! Handler table: the named operations a channel endpoint serves to its peer.

use crate::error::HandlerError;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// An operation callable by the remote peer.
///
/// Implemented for any `Fn(Vec<Value>) -> impl Future<Output = Result<Value, HandlerError>>`,
/// so plain async closures can be registered directly.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, args: Vec<Value>) -> Result<Value, HandlerError>;
}

#[async_trait::async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn call(&self, args: Vec<Value>) -> Result<Value, HandlerError> {
        (self)(args).await
    }
}

/// Mapping of operation name to handler.
#[derive(Clone, Default)]
pub struct Handlers {
    table: HashMap<String, Arc<dyn Handler>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn register(mut self, name: impl Into<String>, handler: impl Handler) -> Self {
        self.insert(name, handler);
        self
    }

    /// Register a handler, replacing any previous one with the same name.
    pub fn insert(&mut self, name: impl Into<String>, handler: impl Handler) {
        self.table.insert(name.into(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.table.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.table.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Invoke the named operation.
    ///
    /// Missing operations and panicking handlers are reported as structured
    /// errors rather than escaping to the caller.
    pub async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value, HandlerError> {
        let handler = self
            .get(name)
            .ok_or_else(|| HandlerError::unknown_handler(name))?;

        match AssertUnwindSafe(handler.call(args)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(HandlerError::new(format!(
                    "RPC handler \"{name}\" panicked: {reason}"
                )))
            }
        }
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("names", &self.names())
            .finish()
    }
}
