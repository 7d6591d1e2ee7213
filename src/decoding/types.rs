//! Decoded event payloads handed to handlers.

use alloy::primitives::{hex, Address, B256, I256, U256};
use serde_json::{Map, Value as JsonValue};

/// A decoded value from an event parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    Addr(Address),
    Uint(U256),
    Int(I256),
    Bool(bool),
    /// A 32-byte word: `bytes32` values and hashes of indexed dynamic types.
    Word(B256),
    Bytes(Vec<u8>),
    Str(String),
    /// Named tuple of (field name, field value) pairs.
    Tuple(Vec<(String, DecodedValue)>),
    Array(Vec<DecodedValue>),
}

impl DecodedValue {
    pub fn as_addr(&self) -> Option<Address> {
        match self {
            DecodedValue::Addr(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_u256(&self) -> Option<U256> {
        match self {
            DecodedValue::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i256(&self) -> Option<I256> {
        match self {
            DecodedValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            DecodedValue::Uint(v) => (*v).try_into().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DecodedValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_word(&self) -> Option<B256> {
        match self {
            DecodedValue::Word(w) => Some(*w),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DecodedValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Tuple field lookup by name.
    pub fn field(&self, name: &str) -> Option<&DecodedValue> {
        match self {
            DecodedValue::Tuple(fields) => {
                fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    /// JSON projection: addresses and words as 0x-prefixed hex, big integers
    /// as decimal strings.
    pub fn to_json(&self) -> JsonValue {
        match self {
            DecodedValue::Addr(a) => JsonValue::String(format!("{a:#x}")),
            DecodedValue::Uint(v) => JsonValue::String(v.to_string()),
            DecodedValue::Int(v) => JsonValue::String(v.to_string()),
            DecodedValue::Bool(b) => JsonValue::Bool(*b),
            DecodedValue::Word(w) => JsonValue::String(format!("{w:#x}")),
            DecodedValue::Bytes(b) => JsonValue::String(hex::encode_prefixed(b)),
            DecodedValue::Str(s) => JsonValue::String(s.clone()),
            DecodedValue::Tuple(fields) => {
                let mut map = Map::new();
                for (name, value) in fields {
                    map.insert(name.clone(), value.to_json());
                }
                JsonValue::Object(map)
            }
            DecodedValue::Array(items) => {
                JsonValue::Array(items.iter().map(DecodedValue::to_json).collect())
            }
        }
    }
}

/// A fully decoded log: which declared event it is and its named arguments,
/// in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub contract_type: String,
    pub event_name: String,
    pub params: Vec<(String, DecodedValue)>,
}

impl DecodedEvent {
    pub fn param(&self, name: &str) -> Option<&DecodedValue> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn params_json(&self) -> JsonValue {
        let mut map = Map::new();
        for (name, value) in &self.params {
            map.insert(name.clone(), value.to_json());
        }
        JsonValue::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_integers_project_as_decimal_strings() {
        let value = DecodedValue::Uint(U256::from(10).pow(U256::from(20)));
        assert_eq!(value.to_json(), JsonValue::String("100000000000000000000".into()));

        let negative = DecodedValue::Int(I256::try_from(-5i64).unwrap());
        assert_eq!(negative.to_json(), JsonValue::String("-5".into()));
    }

    #[test]
    fn test_address_projects_as_lowercase_hex() {
        let addr = Address::repeat_byte(0xAB);
        let json = DecodedValue::Addr(addr).to_json();
        assert_eq!(
            json,
            JsonValue::String("0xabababababababababababababababababababab".into())
        );
    }

    #[test]
    fn test_tuple_field_lookup_and_json() {
        let tuple = DecodedValue::Tuple(vec![
            ("amount".to_string(), DecodedValue::Uint(U256::from(3))),
            ("ok".to_string(), DecodedValue::Bool(true)),
        ]);
        assert_eq!(tuple.field("amount").and_then(DecodedValue::as_u64), Some(3));
        assert!(tuple.field("missing").is_none());

        let json = tuple.to_json();
        assert_eq!(json["amount"], JsonValue::String("3".into()));
        assert_eq!(json["ok"], JsonValue::Bool(true));
    }

    #[test]
    fn test_event_param_lookup() {
        let event = DecodedEvent {
            contract_type: "Gravatar".to_string(),
            event_name: "NewGravatar".to_string(),
            params: vec![("id".to_string(), DecodedValue::Uint(U256::from(1001)))],
        };
        assert_eq!(event.param("id").and_then(DecodedValue::as_u64), Some(1001));
        assert_eq!(event.params_json()["id"], JsonValue::String("1001".into()));
    }
}
