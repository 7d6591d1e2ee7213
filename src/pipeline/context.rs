//! The mutation surface handed to handlers.

use alloy::primitives::Address;

use crate::store::crud::Crud;
use crate::store::entity::EntityRow;
use crate::store::staged::{Provenance, Store};
use crate::types::event::{DynamicContractRow, EventItem};

/// A dynamic contract registration requested by a handler. The fetchers pick
/// it up once the registering batch has committed.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractRegistration {
    pub chain_id: u64,
    pub contract_address: Address,
    pub contract_type: String,
    pub registering_event_id: u64,
    pub registered_at_block: u64,
}

/// Entity getters and setters proxying into the batch's staged store, plus
/// the dynamic-contract hook. One context per handled event, carrying that
/// event's provenance.
pub struct HandlerContext<'a> {
    store: &'a mut Store,
    registrations: &'a mut Vec<ContractRegistration>,
    chain_id: u64,
    event_id: u64,
    block_number: u64,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(
        store: &'a mut Store,
        registrations: &'a mut Vec<ContractRegistration>,
        event: &EventItem,
    ) -> Self {
        Self {
            store,
            registrations,
            chain_id: event.chain_id,
            event_id: event.event_id,
            block_number: event.block_number,
        }
    }

    fn provenance(&self) -> Provenance {
        Provenance {
            chain_id: self.chain_id,
            event_id: self.event_id,
        }
    }

    /// The staged entity, or `None` when absent, deleted, or never declared
    /// by the loader.
    pub fn get(&self, entity_type: &str, id: &str) -> Option<&EntityRow> {
        self.store.get(entity_type, id)
    }

    pub fn insert(&mut self, entity_type: &str, entity: EntityRow) {
        let provenance = self.provenance();
        self.store
            .set(entity_type, entity, Crud::Create, Some(provenance));
    }

    pub fn update(&mut self, entity_type: &str, entity: EntityRow) {
        let provenance = self.provenance();
        self.store
            .set(entity_type, entity, Crud::Update, Some(provenance));
    }

    pub fn delete(&mut self, entity_type: &str, id: &str) {
        let provenance = self.provenance();
        self.store.delete(entity_type, id, Some(provenance));
    }

    /// Register `address` as a fetch target of `contract_type` on this
    /// event's chain, starting at this event's block. The registry row
    /// commits with the batch.
    pub fn register_contract(&mut self, address: Address, contract_type: impl Into<String>) {
        let contract_type = contract_type.into();
        let provenance = self.provenance();
        self.store.set_contract(
            DynamicContractRow {
                chain_id: self.chain_id,
                contract_address: address,
                contract_type: contract_type.clone(),
                registering_event_id: self.event_id,
            },
            Crud::Create,
            Some(provenance),
        );
        self.registrations.push(ContractRegistration {
            chain_id: self.chain_id,
            contract_address: address,
            contract_type,
            registering_event_id: self.event_id,
            registered_at_block: self.block_number,
        });
    }
}
