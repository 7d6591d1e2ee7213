//! Items flowing from the chain fetchers to the processing pipeline.

use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::decoding::types::DecodedEvent;

/// Global ordering key. Events across all chains are emitted in ascending
/// key order; the chain id breaks cross-chain timestamp ties
/// deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderingKey {
    pub block_timestamp: u64,
    pub chain_id: u64,
    pub block_number: u64,
    pub log_index: u64,
}

/// A decoded log ready for handler dispatch.
#[derive(Debug, Clone)]
pub struct EventItem {
    pub chain_id: u64,
    pub event_id: u64,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub block_hash: B256,
    pub transaction_hash: B256,
    pub transaction_index: u64,
    pub log_index: u64,
    pub contract_address: Address,
    pub event: DecodedEvent,
}

impl EventItem {
    pub fn ordering_key(&self) -> OrderingKey {
        OrderingKey {
            block_timestamp: self.block_timestamp,
            chain_id: self.chain_id,
            block_number: self.block_number,
            log_index: self.log_index,
        }
    }

    /// Unique id of a log within its chain.
    pub fn event_id_for(block_number: u64, log_index: u64) -> u64 {
        block_number * 100_000 + log_index
    }

    /// Persisted image of this item.
    pub fn raw_row(&self) -> RawEventRow {
        RawEventRow {
            chain_id: self.chain_id,
            event_id: self.event_id,
            block_number: self.block_number,
            block_timestamp: self.block_timestamp,
            block_hash: self.block_hash,
            transaction_hash: self.transaction_hash,
            transaction_index: self.transaction_index,
            log_index: self.log_index,
            contract_address: self.contract_address,
            event_name: self.event.event_name.clone(),
            params: self.event.params_json(),
        }
    }
}

/// Raw event record persisted alongside entity mutations, so reprocessing
/// does not have to re-query the RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEventRow {
    pub chain_id: u64,
    pub event_id: u64,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub block_hash: B256,
    pub transaction_hash: B256,
    pub transaction_index: u64,
    pub log_index: u64,
    pub contract_address: Address,
    pub event_name: String,
    pub params: JsonValue,
}

/// A contract address registered by a handler at runtime. Registered
/// contracts become fetch targets for subsequent blocks on their chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicContractRow {
    pub chain_id: u64,
    pub contract_address: Address,
    pub contract_type: String,
    pub registering_event_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_key_is_lexicographic() {
        let key = |ts, chain, block, log| OrderingKey {
            block_timestamp: ts,
            chain_id: chain,
            block_number: block,
            log_index: log,
        };
        // Timestamp dominates, then chain id, then block, then log index.
        assert!(key(10, 9, 9, 9) < key(11, 0, 0, 0));
        assert!(key(10, 1, 9, 9) < key(10, 2, 0, 0));
        assert!(key(10, 1, 5, 9) < key(10, 1, 6, 0));
        assert!(key(10, 1, 5, 0) < key(10, 1, 5, 1));
    }

    #[test]
    fn test_event_id_scheme() {
        assert_eq!(EventItem::event_id_for(0, 0), 0);
        assert_eq!(EventItem::event_id_for(500, 3), 50_000_003);
        // Distinct (block, log) pairs map to distinct ids.
        assert_ne!(
            EventItem::event_id_for(1, 0),
            EventItem::event_id_for(0, 100_000 - 1)
        );
    }
}
