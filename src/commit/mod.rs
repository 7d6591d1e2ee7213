//! Transactional commit of a batch's staged mutations.
//!
//! The engine partitions every namespace into deletions (final tag Delete)
//! and upserts (final tag Create or Update), drops Read-only rows, and hands
//! the whole plan to durable storage as one transaction. Statement order is
//! deterministic: namespaces sort by name, rows by key. Checkpoints advance
//! only when the transaction succeeds.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::storage::{CommitBatch, Persistence, StorageError};
use crate::store::crud::Crud;
use crate::store::staged::{StagedRow, Store, StoreError};

#[derive(Debug, Error)]
pub enum CommitError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("checkpoint for chain {chain_id} would regress from {current} to {proposed}")]
    CheckpointRegression {
        chain_id: u64,
        current: u64,
        proposed: u64,
    },
}

impl CommitError {
    /// Storage failures are worth retrying; the rest are bugs.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CommitError::Storage(_))
    }
}

/// The block range a batch covered on one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainRange {
    pub chain_id: u64,
    pub from_block: u64,
    pub to_block: u64,
}

pub struct CommitEngine {
    storage: Arc<dyn Persistence>,
    checkpoints: HashMap<u64, u64>,
}

impl CommitEngine {
    pub fn new(storage: Arc<dyn Persistence>) -> Self {
        Self {
            storage,
            checkpoints: HashMap::new(),
        }
    }

    /// Seed a chain's checkpoint from durable state at startup.
    pub fn resume_checkpoint(&mut self, chain_id: u64, block: u64) {
        self.checkpoints.insert(chain_id, block);
    }

    pub fn checkpoint(&self, chain_id: u64) -> Option<u64> {
        self.checkpoints.get(&chain_id).copied()
    }

    pub async fn commit(
        &mut self,
        store: &Store,
        ranges: &[ChainRange],
    ) -> Result<(), CommitError> {
        let batch = self.build_batch(store, ranges)?;
        if batch.is_empty() {
            return Ok(());
        }

        self.storage.commit(batch).await?;

        for range in ranges {
            self.checkpoints.insert(range.chain_id, range.to_block);
        }
        tracing::debug!(ranges = ?ranges, "batch committed");
        Ok(())
    }

    fn build_batch(
        &self,
        store: &Store,
        ranges: &[ChainRange],
    ) -> Result<CommitBatch, CommitError> {
        for range in ranges {
            if let Some(&current) = self.checkpoints.get(&range.chain_id) {
                if range.to_block < current {
                    return Err(CommitError::CheckpointRegression {
                        chain_id: range.chain_id,
                        current,
                        proposed: range.to_block,
                    });
                }
            }
        }

        let mut batch = CommitBatch::default();

        let mut namespaces: Vec<_> = store.entity_namespaces().collect();
        namespaces.sort_by(|a, b| a.0.cmp(b.0));
        for (entity_type, namespace) in namespaces {
            let mut entries: Vec<(&String, &StagedRow<_>)> = namespace.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            let mut deletes = Vec::new();
            let mut upserts = Vec::new();
            for (id, row) in entries {
                match row.crud {
                    Crud::Read => {}
                    Crud::Delete => deletes.push(id.clone()),
                    Crud::Create | Crud::Update => match &row.value {
                        Some(value) => upserts.push(value.clone()),
                        None => {
                            return Err(StoreError::InvariantViolated {
                                entity_type: entity_type.to_string(),
                                id: id.clone(),
                                crud: row.crud,
                            }
                            .into())
                        }
                    },
                }
            }
            if !deletes.is_empty() {
                batch
                    .entity_deletes
                    .push((entity_type.to_string(), deletes));
            }
            if !upserts.is_empty() {
                batch
                    .entity_upserts
                    .push((entity_type.to_string(), upserts));
            }
        }

        let mut raw_entries: Vec<_> = store.raw_events().iter().collect();
        raw_entries.sort_by_key(|(key, _)| **key);
        for (key, row) in raw_entries {
            match row.crud {
                Crud::Read => {}
                Crud::Delete => batch.raw_event_deletes.push(*key),
                Crud::Create | Crud::Update => match &row.value {
                    Some(value) => batch.raw_events.push(value.clone()),
                    None => {
                        return Err(StoreError::InvariantViolated {
                            entity_type: "raw_events".to_string(),
                            id: format!("{key:?}"),
                            crud: row.crud,
                        }
                        .into())
                    }
                },
            }
        }

        let mut contract_entries: Vec<_> = store.contracts().iter().collect();
        contract_entries.sort_by_key(|(key, _)| **key);
        for (key, row) in contract_entries {
            match row.crud {
                Crud::Read => {}
                Crud::Delete => batch.contract_deletes.push(*key),
                Crud::Create | Crud::Update => match &row.value {
                    Some(value) => batch.contract_upserts.push(value.clone()),
                    None => {
                        return Err(StoreError::InvariantViolated {
                            entity_type: "dynamic_contract_registry".to_string(),
                            id: format!("{key:?}"),
                            crud: row.crud,
                        }
                        .into())
                    }
                },
            }
        }

        let mut checkpoints: Vec<(u64, u64)> = ranges
            .iter()
            .map(|range| (range.chain_id, range.to_block))
            .collect();
        checkpoints.sort_unstable();
        batch.checkpoints = checkpoints;

        Ok(batch)
    }
}
