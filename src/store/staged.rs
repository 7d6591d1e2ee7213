//! In-memory write-back store, staged per batch.
//!
//! The store is created empty for each batch, mutated exclusively by handler
//! contexts, read by the commit engine, then reset. It is single-owner for
//! the duration of a batch, so nothing here locks.

use std::collections::HashMap;

use alloy::primitives::Address;
use thiserror::Error;

use crate::types::event::{DynamicContractRow, RawEventRow};

use super::crud::Crud;
use super::entity::EntityRow;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("staged {crud:?} row for {entity_type}/{id} carries no value")]
    InvariantViolated {
        entity_type: String,
        id: String,
        crud: Crud,
    },
}

/// Which event staged a mutation, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Provenance {
    pub chain_id: u64,
    pub event_id: u64,
}

/// One staged row: the folded tag, the latest value, and its origin.
/// The value is `None` only for rows deleted without ever being staged.
#[derive(Debug, Clone)]
pub struct StagedRow<T> {
    pub crud: Crud,
    pub value: Option<T>,
    pub provenance: Option<Provenance>,
}

/// Per-entity-type namespaces of staged rows, plus the raw-event and
/// dynamic-contract namespaces that share the same commit boundary.
#[derive(Debug, Default)]
pub struct Store {
    entities: HashMap<String, HashMap<String, StagedRow<EntityRow>>>,
    raw_events: HashMap<(u64, u64), StagedRow<RawEventRow>>,
    contracts: HashMap<(u64, Address), StagedRow<DynamicContractRow>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// The staged entity, if present and not deleted. Reads see the
    /// handlers' own uncommitted writes.
    pub fn get(&self, entity_type: &str, id: &str) -> Option<&EntityRow> {
        self.entities
            .get(entity_type)?
            .get(id)
            .filter(|row| row.crud != Crud::Delete)
            .and_then(|row| row.value.as_ref())
    }

    /// Stage an entity value under `next`, folding with any existing tag.
    pub fn set(
        &mut self,
        entity_type: &str,
        entity: EntityRow,
        next: Crud,
        provenance: Option<Provenance>,
    ) {
        let namespace = self.entities.entry(entity_type.to_string()).or_default();
        let prev = namespace.get(&entity.id).map(|row| row.crud);
        if prev.is_some() && next == Crud::Create {
            tracing::warn!(
                entity_type,
                id = %entity.id,
                prev = ?prev,
                "create staged over an existing row, committing as upsert"
            );
        }
        let crud = Crud::fold(prev, next);
        namespace.insert(
            entity.id.clone(),
            StagedRow {
                crud,
                value: Some(entity),
                provenance,
            },
        );
    }

    /// Stage a deletion, keeping the last-known value if any.
    pub fn delete(&mut self, entity_type: &str, id: &str, provenance: Option<Provenance>) {
        let namespace = self.entities.entry(entity_type.to_string()).or_default();
        let (prev, value) = match namespace.get(id) {
            Some(row) => (Some(row.crud), row.value.clone()),
            None => (None, None),
        };
        let crud = Crud::fold(prev, Crud::Delete);
        namespace.insert(
            id.to_string(),
            StagedRow {
                crud,
                value,
                provenance,
            },
        );
    }

    pub fn set_raw_event(&mut self, row: RawEventRow, next: Crud, provenance: Option<Provenance>) {
        let key = (row.chain_id, row.event_id);
        let prev = self.raw_events.get(&key).map(|r| r.crud);
        let crud = Crud::fold(prev, next);
        self.raw_events.insert(
            key,
            StagedRow {
                crud,
                value: Some(row),
                provenance,
            },
        );
    }

    pub fn set_contract(
        &mut self,
        row: DynamicContractRow,
        next: Crud,
        provenance: Option<Provenance>,
    ) {
        let key = (row.chain_id, row.contract_address);
        let prev = self.contracts.get(&key).map(|r| r.crud);
        let crud = Crud::fold(prev, next);
        self.contracts.insert(
            key,
            StagedRow {
                crud,
                value: Some(row),
                provenance,
            },
        );
    }

    /// Clear every namespace.
    pub fn reset(&mut self) {
        self.entities.clear();
        self.raw_events.clear();
        self.contracts.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entities.values().all(HashMap::is_empty)
            && self.raw_events.is_empty()
            && self.contracts.is_empty()
    }

    pub fn entity_namespaces(
        &self,
    ) -> impl Iterator<Item = (&str, &HashMap<String, StagedRow<EntityRow>>)> {
        self.entities
            .iter()
            .map(|(entity_type, namespace)| (entity_type.as_str(), namespace))
    }

    pub fn entity_namespace(&self, entity_type: &str) -> Option<&HashMap<String, StagedRow<EntityRow>>> {
        self.entities.get(entity_type)
    }

    pub fn raw_events(&self) -> &HashMap<(u64, u64), StagedRow<RawEventRow>> {
        &self.raw_events
    }

    pub fn contracts(&self) -> &HashMap<(u64, Address), StagedRow<DynamicContractRow>> {
        &self.contracts
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::store::entity::FieldValue;

    use super::*;

    fn entity(id: &str, count: i64) -> EntityRow {
        EntityRow::new(id).with_field("updatesCount", FieldValue::Int(count))
    }

    fn staged_crud(store: &Store, entity_type: &str, id: &str) -> Option<Crud> {
        store
            .entity_namespace(entity_type)
            .and_then(|ns| ns.get(id))
            .map(|row| row.crud)
    }

    #[test]
    fn test_get_absent_is_none() {
        let store = Store::new();
        assert!(store.get("Gravatar", "1001").is_none());
    }

    #[test]
    fn test_get_sees_own_writes() {
        let mut store = Store::new();
        store.set("Gravatar", entity("1001", 1), Crud::Create, None);
        let row = store.get("Gravatar", "1001").unwrap();
        assert_eq!(row.field("updatesCount").and_then(FieldValue::as_i64), Some(1));
    }

    #[test]
    fn test_get_after_delete_is_none() {
        let mut store = Store::new();
        store.set("Gravatar", entity("1001", 1), Crud::Create, None);
        store.delete("Gravatar", "1001", None);
        assert!(store.get("Gravatar", "1001").is_none());
        // The staged row still remembers the last-known value for commit.
        let ns = store.entity_namespace("Gravatar").unwrap();
        assert!(ns.get("1001").unwrap().value.is_some());
    }

    #[test]
    fn test_delete_never_staged_has_no_value() {
        let mut store = Store::new();
        store.delete("Gravatar", "1001", None);
        let ns = store.entity_namespace("Gravatar").unwrap();
        let row = ns.get("1001").unwrap();
        assert_eq!(row.crud, Crud::Delete);
        assert!(row.value.is_none());
    }

    #[test]
    fn test_create_then_delete_then_create_is_update_with_second_value() {
        let mut store = Store::new();
        store.set("Gravatar", entity("1003", 1), Crud::Create, None);
        store.delete("Gravatar", "1003", None);
        store.set("Gravatar", entity("1003", 7), Crud::Create, None);

        assert_eq!(staged_crud(&store, "Gravatar", "1003"), Some(Crud::Update));
        let row = store.get("Gravatar", "1003").unwrap();
        assert_eq!(row.field("updatesCount").and_then(FieldValue::as_i64), Some(7));
    }

    #[test]
    fn test_set_after_delete_returns_new_entity() {
        let mut store = Store::new();
        store.set("Account", entity("a", 1), Crud::Read, None);
        store.delete("Account", "a", None);
        assert!(store.get("Account", "a").is_none());
        store.set("Account", entity("a", 2), Crud::Update, None);
        let row = store.get("Account", "a").unwrap();
        assert_eq!(row.field("updatesCount").and_then(FieldValue::as_i64), Some(2));
        assert_eq!(staged_crud(&store, "Account", "a"), Some(Crud::Update));
    }

    #[test]
    fn test_namespaces_are_independent() {
        let mut store = Store::new();
        store.set("Gravatar", entity("1", 1), Crud::Create, None);
        store.set("Account", entity("1", 2), Crud::Create, None);
        assert_eq!(
            store.get("Gravatar", "1").unwrap().field("updatesCount"),
            Some(&FieldValue::Int(1))
        );
        assert_eq!(
            store.get("Account", "1").unwrap().field("updatesCount"),
            Some(&FieldValue::Int(2))
        );
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut store = Store::new();
        store.set("Gravatar", entity("1", 1), Crud::Create, None);
        store.delete("Account", "2", None);
        assert!(!store.is_empty());
        store.reset();
        assert!(store.is_empty());
        assert!(store.get("Gravatar", "1").is_none());
    }

    #[test]
    fn test_provenance_is_recorded() {
        let mut store = Store::new();
        let prov = Provenance {
            chain_id: 1,
            event_id: 50_000_003,
        };
        store.set("Gravatar", entity("1", 1), Crud::Create, Some(prov));
        let ns = store.entity_namespace("Gravatar").unwrap();
        assert_eq!(ns.get("1").unwrap().provenance, Some(prov));
    }

    fn arb_crud() -> impl Strategy<Value = Crud> {
        prop_oneof![
            Just(Crud::Create),
            Just(Crud::Read),
            Just(Crud::Update),
            Just(Crud::Delete),
        ]
    }

    proptest! {
        // The tag staged after any sequence of set calls equals the
        // left-to-right fold of the table over that sequence.
        #[test]
        fn prop_staged_tag_is_left_fold(tags in prop::collection::vec(arb_crud(), 1..20)) {
            let mut store = Store::new();
            let mut expected = None;
            for (i, tag) in tags.iter().enumerate() {
                store.set("E", entity("x", i as i64), *tag, None);
                expected = Some(Crud::fold(expected, *tag));
            }
            prop_assert_eq!(staged_crud(&store, "E", "x"), expected);
        }

        // At most one staged row ever exists per (type, id).
        #[test]
        fn prop_single_row_per_id(tags in prop::collection::vec(arb_crud(), 1..20)) {
            let mut store = Store::new();
            for tag in &tags {
                store.set("E", entity("x", 0), *tag, None);
            }
            prop_assert_eq!(store.entity_namespace("E").unwrap().len(), 1);
        }
    }
}
