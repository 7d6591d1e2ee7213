//! Handler registration, keyed by (contract type, event name).

use std::collections::HashMap;
use std::sync::Arc;

use super::traits::EventHandler;

pub struct HandlerRegistry {
    handlers: HashMap<(String, String), Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for each of its triggers. Each event has exactly
    /// one handler; a duplicate trigger replaces the previous registration.
    pub fn register<H: EventHandler>(&mut self, handler: H) {
        let handler = Arc::new(handler);
        for trigger in handler.triggers() {
            let key = (trigger.contract_type.clone(), trigger.event_name.clone());
            if self.handlers.insert(key, handler.clone()).is_some() {
                tracing::warn!(
                    contract_type = %trigger.contract_type,
                    event_name = %trigger.event_name,
                    "replacing an existing handler registration"
                );
            }
        }
    }

    pub fn handler_for(
        &self,
        contract_type: &str,
        event_name: &str,
    ) -> Option<Arc<dyn EventHandler>> {
        self.handlers
            .get(&(contract_type.to_string(), event_name.to_string()))
            .cloned()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Central place where generated code registers its handlers.
/// Add registrations here as event handlers are implemented.
pub fn build_registry() -> HandlerRegistry {
    let registry = HandlerRegistry::new();

    tracing::info!(
        handlers = registry.handler_count(),
        "built handler registry"
    );
    registry
}
