//! Two-phase batch execution: load everything, then handle in batch order.

use std::sync::Arc;

use thiserror::Error;

use crate::storage::{Persistence, StorageError};
use crate::store::crud::Crud;
use crate::store::staged::{Provenance, Store};
use crate::types::event::EventItem;

use super::context::{ContractRegistration, HandlerContext};
use super::loader::{run_load_phase, LoaderContext};
use super::registry::HandlerRegistry;
use super::traits::HandlerError;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("handler for {event} failed (chain {chain_id}, event {event_id}): {source}")]
    Handler {
        event: String,
        chain_id: u64,
        event_id: u64,
        #[source]
        source: HandlerError,
    },
}

pub struct BatchProcessor {
    handlers: Arc<HandlerRegistry>,
    storage: Arc<dyn Persistence>,
}

impl BatchProcessor {
    pub fn new(handlers: Arc<HandlerRegistry>, storage: Arc<dyn Persistence>) -> Self {
        Self { handlers, storage }
    }

    /// Run the batch against the store: collect every loader's declarations,
    /// satisfy them with bulk reads, then invoke handlers in batch order.
    /// Every item's raw-event image is staged regardless of whether a
    /// handler is registered for it. Returns the dynamic contract
    /// registrations requested by handlers.
    pub async fn process(
        &self,
        batch: &[EventItem],
        store: &mut Store,
    ) -> Result<Vec<ContractRegistration>, ProcessError> {
        let mut loader = LoaderContext::default();
        for item in batch {
            if let Some(handler) = self
                .handlers
                .handler_for(&item.event.contract_type, &item.event.event_name)
            {
                handler.load(item, &mut loader);
            }
        }
        run_load_phase(self.storage.as_ref(), store, loader).await?;

        let mut registrations = Vec::new();
        for item in batch {
            store.set_raw_event(
                item.raw_row(),
                Crud::Create,
                Some(Provenance {
                    chain_id: item.chain_id,
                    event_id: item.event_id,
                }),
            );

            let Some(handler) = self
                .handlers
                .handler_for(&item.event.contract_type, &item.event.event_name)
            else {
                tracing::debug!(
                    contract_type = %item.event.contract_type,
                    event_name = %item.event.event_name,
                    "no handler registered, raw event staged only"
                );
                continue;
            };

            let mut ctx = HandlerContext::new(store, &mut registrations, item);
            handler
                .handle(item, &mut ctx)
                .await
                .map_err(|source| ProcessError::Handler {
                    event: format!("{}.{}", item.event.contract_type, item.event.event_name),
                    chain_id: item.chain_id,
                    event_id: item.event_id,
                    source,
                })?;
        }

        Ok(registrations)
    }
}
