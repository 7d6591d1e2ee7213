//! Durable storage boundary.
//!
//! The commit engine builds a [`CommitBatch`] and hands it over whole; the
//! implementation applies it inside a single transaction. How rows become
//! SQL is this module's concern alone.

pub mod error;
pub mod memory;
pub mod postgres;

use alloy::primitives::Address;
use async_trait::async_trait;

use crate::store::entity::EntityRow;
use crate::types::event::{DynamicContractRow, RawEventRow};

pub use error::StorageError;
pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;

/// Everything a batch commits atomically. Vectors are pre-sorted by the
/// commit engine so statement order is deterministic across runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitBatch {
    /// (entity type, rows to insert-or-update), sorted by type then id.
    pub entity_upserts: Vec<(String, Vec<EntityRow>)>,
    /// (entity type, ids to delete), sorted by type then id.
    pub entity_deletes: Vec<(String, Vec<String>)>,
    pub raw_events: Vec<RawEventRow>,
    pub raw_event_deletes: Vec<(u64, u64)>,
    pub contract_upserts: Vec<DynamicContractRow>,
    pub contract_deletes: Vec<(u64, Address)>,
    /// (chain id, latest processed block), recorded last.
    pub checkpoints: Vec<(u64, u64)>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        self.entity_upserts.is_empty()
            && self.entity_deletes.is_empty()
            && self.raw_events.is_empty()
            && self.raw_event_deletes.is_empty()
            && self.contract_upserts.is_empty()
            && self.contract_deletes.is_empty()
            && self.checkpoints.is_empty()
    }
}

/// Handle to the relational store.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    /// One bulk read per entity type; absent ids are simply not returned.
    async fn batch_read(
        &self,
        entity_type: &str,
        ids: &[String],
    ) -> Result<Vec<EntityRow>, StorageError>;

    /// Apply the whole batch inside a single transaction.
    async fn commit(&self, batch: CommitBatch) -> Result<(), StorageError>;

    async fn latest_processed_block(&self, chain_id: u64) -> Result<Option<u64>, StorageError>;

    /// Every dynamic contract registered by past runs.
    async fn dynamic_contracts(&self) -> Result<Vec<DynamicContractRow>, StorageError>;
}
