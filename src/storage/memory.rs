//! In-process persistence. Backs tests and dry runs with the same contract
//! as the Postgres implementation, including all-or-nothing commits.

use std::collections::BTreeMap;

use alloy::primitives::Address;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::store::entity::EntityRow;
use crate::types::event::{DynamicContractRow, RawEventRow};

use super::{CommitBatch, Persistence, StorageError};

#[derive(Debug, Default, Clone)]
struct Tables {
    entities: BTreeMap<String, BTreeMap<String, EntityRow>>,
    raw_events: BTreeMap<(u64, u64), RawEventRow>,
    contracts: BTreeMap<(u64, Address), DynamicContractRow>,
    checkpoints: BTreeMap<u64, u64>,
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one entity table, for assertions.
    pub fn entity_table(&self, entity_type: &str) -> BTreeMap<String, EntityRow> {
        self.tables
            .lock()
            .entities
            .get(entity_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of every entity table.
    pub fn all_entities(&self) -> BTreeMap<String, BTreeMap<String, EntityRow>> {
        self.tables.lock().entities.clone()
    }

    pub fn raw_event_count(&self) -> usize {
        self.tables.lock().raw_events.len()
    }

    pub fn checkpoint(&self, chain_id: u64) -> Option<u64> {
        self.tables.lock().checkpoints.get(&chain_id).copied()
    }

    /// Drop all durable state, as a fresh database would have.
    pub fn clear(&self) {
        *self.tables.lock() = Tables::default();
    }
}

#[async_trait]
impl Persistence for MemoryStorage {
    async fn batch_read(
        &self,
        entity_type: &str,
        ids: &[String],
    ) -> Result<Vec<EntityRow>, StorageError> {
        let tables = self.tables.lock();
        let Some(table) = tables.entities.get(entity_type) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| table.get(id).cloned())
            .collect())
    }

    async fn commit(&self, batch: CommitBatch) -> Result<(), StorageError> {
        let mut tables = self.tables.lock();

        for (entity_type, ids) in &batch.entity_deletes {
            if let Some(table) = tables.entities.get_mut(entity_type) {
                for id in ids {
                    table.remove(id);
                }
            }
        }
        for (entity_type, rows) in &batch.entity_upserts {
            let table = tables.entities.entry(entity_type.clone()).or_default();
            for row in rows {
                table.insert(row.id.clone(), row.clone());
            }
        }

        for key in &batch.raw_event_deletes {
            tables.raw_events.remove(key);
        }
        for row in &batch.raw_events {
            tables.raw_events.insert((row.chain_id, row.event_id), row.clone());
        }

        for key in &batch.contract_deletes {
            tables.contracts.remove(key);
        }
        for row in &batch.contract_upserts {
            tables
                .contracts
                .insert((row.chain_id, row.contract_address), row.clone());
        }

        for (chain_id, block) in &batch.checkpoints {
            tables.checkpoints.insert(*chain_id, *block);
        }

        Ok(())
    }

    async fn latest_processed_block(&self, chain_id: u64) -> Result<Option<u64>, StorageError> {
        Ok(self.tables.lock().checkpoints.get(&chain_id).copied())
    }

    async fn dynamic_contracts(&self) -> Result<Vec<DynamicContractRow>, StorageError> {
        Ok(self.tables.lock().contracts.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use crate::store::entity::FieldValue;

    use super::*;

    #[tokio::test]
    async fn test_commit_then_read_back() {
        let storage = MemoryStorage::new();
        let row = EntityRow::new("a").with_field("balance", FieldValue::Int(5));
        storage
            .commit(CommitBatch {
                entity_upserts: vec![("Account".to_string(), vec![row.clone()])],
                checkpoints: vec![(1, 100)],
                ..CommitBatch::default()
            })
            .await
            .unwrap();

        let read = storage
            .batch_read("Account", &["a".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(read, vec![row]);
        assert_eq!(storage.latest_processed_block(1).await.unwrap(), Some(100));
        assert_eq!(storage.latest_processed_block(2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_removes_rows() {
        let storage = MemoryStorage::new();
        storage
            .commit(CommitBatch {
                entity_upserts: vec![(
                    "Account".to_string(),
                    vec![EntityRow::new("a"), EntityRow::new("b")],
                )],
                ..CommitBatch::default()
            })
            .await
            .unwrap();
        storage
            .commit(CommitBatch {
                entity_deletes: vec![("Account".to_string(), vec!["a".to_string()])],
                ..CommitBatch::default()
            })
            .await
            .unwrap();
        assert_eq!(storage.entity_table("Account").len(), 1);
        assert!(storage.entity_table("Account").contains_key("b"));
    }
}
