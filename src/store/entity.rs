//! Entity rows and their typed field values.

use std::collections::BTreeMap;

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};

/// A single typed field of an entity.
///
/// Adjacently tagged so values survive the JSONB round trip without big
/// integers, addresses, and plain text collapsing into one another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    BigInt(U256),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Addr(Address),
    List(Vec<FieldValue>),
}

impl FieldValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u256(&self) -> Option<U256> {
        match self {
            FieldValue::BigInt(v) => Some(*v),
            FieldValue::Int(v) if *v >= 0 => Some(U256::from(*v as u64)),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_addr(&self) -> Option<Address> {
        match self {
            FieldValue::Addr(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Entity ids referenced by this field: a `Text` value is a single
    /// reference, a `List` of `Text` values references each element.
    pub fn reference_ids(&self) -> Vec<String> {
        match self {
            FieldValue::Text(id) => vec![id.clone()],
            FieldValue::List(items) => items
                .iter()
                .filter_map(|v| v.as_text().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// A user-declared record with a mandatory string id. Field layout is
/// whatever the declaring schema says; the indexing core treats it as an
/// ordered name/value map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub id: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl EntityRow {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_value_round_trips_through_json() {
        let values = vec![
            FieldValue::Null,
            FieldValue::Bool(true),
            FieldValue::Int(-42),
            FieldValue::BigInt(U256::from(10).pow(U256::from(30))),
            FieldValue::Text("0x123".to_string()),
            FieldValue::Bytes(vec![1, 2, 3]),
            FieldValue::Addr(Address::repeat_byte(0xaa)),
            FieldValue::List(vec![
                FieldValue::Text("a".to_string()),
                FieldValue::Text("b".to_string()),
            ]),
        ];
        for value in values {
            let json = serde_json::to_value(&value).unwrap();
            let back: FieldValue = serde_json::from_value(json).unwrap();
            assert_eq!(back, value);
        }
    }

    #[test]
    fn test_bigint_and_text_stay_distinct_in_json() {
        let big = serde_json::to_value(FieldValue::BigInt(U256::from(7))).unwrap();
        let text = serde_json::to_value(FieldValue::Text("7".to_string())).unwrap();
        assert_ne!(big, text);
    }

    #[test]
    fn test_reference_ids() {
        assert_eq!(
            FieldValue::Text("id1".to_string()).reference_ids(),
            vec!["id1".to_string()]
        );
        assert_eq!(
            FieldValue::List(vec![
                FieldValue::Text("a".to_string()),
                FieldValue::Int(3),
                FieldValue::Text("b".to_string()),
            ])
            .reference_ids(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(FieldValue::Int(1).reference_ids().is_empty());
    }

    #[test]
    fn test_entity_row_builder() {
        let row = EntityRow::new("1001")
            .with_field("owner", FieldValue::Addr(Address::ZERO))
            .with_field("updatesCount", FieldValue::Int(1));
        assert_eq!(row.id, "1001");
        assert_eq!(row.field("updatesCount").and_then(FieldValue::as_i64), Some(1));
        assert!(row.field("missing").is_none());
    }
}
