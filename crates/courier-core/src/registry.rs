//! Handler registry
//!
//! Maps routing keys to handlers. Populated during setup and shared
//! read-only by every consume loop once the consumer starts.

use std::collections::HashMap;
use std::sync::Arc;

use courier_types::{Error, Result};
use tracing::debug;

use crate::handler::Handler;

/// Routing key -> handler table
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a routing key
    ///
    /// Fails on an empty key or when the key already has a handler; an
    /// existing registration is never replaced.
    pub fn register<H: Handler>(&mut self, routing_key: impl Into<String>, handler: H) -> Result<()> {
        self.register_arc(routing_key, Arc::new(handler))
    }

    /// Register an already shared handler
    pub fn register_arc(
        &mut self,
        routing_key: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<()> {
        let routing_key = routing_key.into();
        if routing_key.is_empty() {
            return Err(Error::InvalidRoutingKey(routing_key));
        }
        if self.handlers.contains_key(&routing_key) {
            return Err(Error::HandlerAlreadyRegistered(routing_key));
        }

        debug!(routing_key = %routing_key, "Handler registered");
        self.handlers.insert(routing_key, handler);
        Ok(())
    }

    /// Get the handler for a routing key
    pub fn lookup(&self, routing_key: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(routing_key).cloned()
    }

    pub fn contains(&self, routing_key: &str) -> bool {
        self.handlers.contains_key(routing_key)
    }

    /// All registered routing keys, sorted
    pub fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self.handlers.keys().cloned().collect();
        routes.sort();
        routes
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use courier_types::OutboundResponse;

    fn reply(text: &'static str) -> impl Handler {
        handler_fn(move |_msg| async move { anyhow::Ok(Some(OutboundResponse::new(text))) })
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register("greet", reply("hi")).unwrap();

        assert!(registry.lookup("greet").is_some());
        assert!(registry.lookup("unknown").is_none());
        assert!(registry.contains("greet"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_key_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register("greet", reply("hi")).unwrap();

        let result = registry.register("greet", reply("hello"));
        assert!(matches!(result, Err(Error::HandlerAlreadyRegistered(key)) if key == "greet"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_empty_key_is_rejected() {
        let mut registry = HandlerRegistry::new();
        let result = registry.register("", reply("hi"));
        assert!(matches!(result, Err(Error::InvalidRoutingKey(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_routes_are_sorted() {
        let mut registry = HandlerRegistry::new();
        registry.register("log", reply("")).unwrap();
        registry.register("greet", reply("")).unwrap();
        registry.register("audit.write", reply("")).unwrap();

        assert_eq!(registry.routes(), vec!["audit.write", "greet", "log"]);
    }
}
