//! The two-phase handler contract.
//!
//! For every event in a batch the runtime first calls `load`, which only
//! declares the entity ids the handler intends to read. The declarations are
//! satisfied with one bulk read per entity type, then `handle` runs in batch
//! order against the populated in-memory store. Handlers never touch durable
//! storage directly; a get for an id the loader did not declare is `None`.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::event::EventItem;

use super::context::HandlerContext;
use super::loader::LoaderContext;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("event {event} is missing parameter {param}")]
    MissingParam { event: String, param: String },

    #[error("{0}")]
    Other(String),
}

impl HandlerError {
    pub fn missing_param(event: &str, param: &str) -> Self {
        HandlerError::MissingParam {
            event: event.to_string(),
            param: param.to_string(),
        }
    }
}

/// An event a handler subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventTrigger {
    pub contract_type: String,
    pub event_name: String,
}

impl EventTrigger {
    pub fn new(contract_type: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            contract_type: contract_type.into(),
            event_name: event_name.into(),
        }
    }
}

/// User-supplied per-event callbacks, registered at startup.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    fn triggers(&self) -> Vec<EventTrigger>;

    /// Declare the entity ids this handler will read. Purely declarative;
    /// no I/O happens here.
    #[allow(unused_variables)]
    fn load(&self, event: &EventItem, loader: &mut LoaderContext) {}

    /// Apply the event to the store through the context. Any asynchronous
    /// work must resolve before returning.
    async fn handle(
        &self,
        event: &EventItem,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<(), HandlerError>;
}
