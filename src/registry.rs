//! Job registries: name to handler lookup, composable by fallback chaining.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::handler::JobHandler;

/// A source of job handlers.
///
/// Registries are queried each time a name is first resolved; caching is
/// the scheduler's concern, not the registry's.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Look up a handler by job name.
    async fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>>;
}

/// In-memory name to handler table.
pub struct SimpleRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl SimpleRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler under its description's name.
    ///
    /// Registering a name that already exists is an error; silent
    /// shadowing is never allowed.
    pub async fn register(&self, handler: Arc<dyn JobHandler>) -> Result<()> {
        let name = handler.description().name.clone();
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(&name) {
            return Err(Error::NameConflict { name });
        }
        tracing::debug!(job = %name, "registered job handler");
        handlers.insert(name, handler);
        Ok(())
    }

    /// Check if a name is registered.
    pub async fn has(&self, name: &str) -> bool {
        self.handlers.read().await.contains_key(name)
    }

    /// List all registered names.
    pub async fn list(&self) -> Vec<String> {
        self.handlers.read().await.keys().cloned().collect()
    }
}

impl Default for SimpleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for SimpleRegistry {
    async fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().await.get(name).cloned()
    }
}

/// An ordered chain of registries; the first hit wins.
pub struct FallbackRegistry {
    sources: Vec<Arc<dyn Registry>>,
}

impl FallbackRegistry {
    /// Compose an ordered list of registries.
    pub fn new(sources: Vec<Arc<dyn Registry>>) -> Self {
        Self { sources }
    }

    /// Append a registry at the end of the chain.
    pub fn push(&mut self, source: Arc<dyn Registry>) {
        self.sources.push(source);
    }
}

#[async_trait]
impl Registry for FallbackRegistry {
    async fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        for source in &self.sources {
            if let Some(handler) = source.get(name).await {
                return Some(handler);
            }
        }
        None
    }
}
