//! Load phase: unique-id collection, bulk reads, one-hop reference
//! expansion.

use std::collections::{BTreeMap, BTreeSet};

use crate::storage::{Persistence, StorageError};
use crate::store::crud::Crud;
use crate::store::entity::FieldValue;
use crate::store::staged::Store;

/// A field on a loaded entity whose value is another entity's id (or a list
/// of them), declared so the referenced entities load in the same phase.
#[derive(Debug, Clone)]
pub struct ReferenceField {
    pub field: String,
    pub entity_type: String,
}

impl ReferenceField {
    pub fn new(field: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            entity_type: entity_type.into(),
        }
    }
}

/// Collects the entity ids a batch's loaders declare. Ids are deduplicated
/// per entity type; reference declarations for the same id merge.
#[derive(Debug, Default)]
pub struct LoaderContext {
    requests: BTreeMap<String, BTreeMap<String, Vec<ReferenceField>>>,
}

impl LoaderContext {
    pub fn load(&mut self, entity_type: &str, id: &str) {
        self.requests
            .entry(entity_type.to_string())
            .or_default()
            .entry(id.to_string())
            .or_default();
    }

    pub fn load_with_references(
        &mut self,
        entity_type: &str,
        id: &str,
        references: Vec<ReferenceField>,
    ) {
        self.requests
            .entry(entity_type.to_string())
            .or_default()
            .entry(id.to_string())
            .or_default()
            .extend(references);
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn requested_ids(&self, entity_type: &str) -> Vec<String> {
        self.requests
            .get(entity_type)
            .map(|ids| ids.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Satisfy every declared load with one bulk read per entity type, stage the
/// results as `Read`, then follow declared references exactly one relational
/// hop and bulk-read those too.
pub async fn run_load_phase(
    storage: &dyn Persistence,
    store: &mut Store,
    ctx: LoaderContext,
) -> Result<(), StorageError> {
    let mut follow_ups: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for (entity_type, ids) in &ctx.requests {
        let id_list: Vec<String> = ids.keys().cloned().collect();
        let rows = storage.batch_read(entity_type, &id_list).await?;
        tracing::debug!(
            entity_type,
            requested = id_list.len(),
            found = rows.len(),
            "bulk read"
        );
        for row in rows {
            if let Some(references) = ids.get(&row.id) {
                for reference in references {
                    let targets = row
                        .field(&reference.field)
                        .map(FieldValue::reference_ids)
                        .unwrap_or_default();
                    follow_ups
                        .entry(reference.entity_type.clone())
                        .or_default()
                        .extend(targets);
                }
            }
            store.set(entity_type, row, Crud::Read, None);
        }
    }

    // One hop only; references of referenced entities are not chased.
    for (entity_type, ids) in follow_ups {
        let id_list: Vec<String> = ids
            .into_iter()
            .filter(|id| store.get(&entity_type, id).is_none())
            .collect();
        if id_list.is_empty() {
            continue;
        }
        let rows = storage.batch_read(&entity_type, &id_list).await?;
        tracing::debug!(
            entity_type = %entity_type,
            requested = id_list.len(),
            found = rows.len(),
            "reference bulk read"
        );
        for row in rows {
            store.set(&entity_type, row, Crud::Read, None);
        }
    }

    Ok(())
}
