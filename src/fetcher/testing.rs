//! Shared fixtures for fetcher and merge tests: a scriptable provider and
//! canned chains, logs, and items.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU32, Ordering};

use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::{Block, Filter, Log};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::decoding::event_parsing::ParsedEvent;
use crate::decoding::types::DecodedEvent;
use crate::rpc::{LogProvider, RpcError};
use crate::types::config::chain::{AddressOrAddresses, ChainConfig, ContractConfig};
use crate::types::event::EventItem;

pub const PING_ADDRESS: Address = Address::repeat_byte(0x51);

/// Chain config with a single "Ping" contract emitting `Ping(uint256 id)`.
pub fn ping_chain_config(chain_id: u64) -> ChainConfig {
    ChainConfig {
        name: format!("chain-{chain_id}"),
        chain_id,
        rpc_url_env_var: "TEST_RPC_URL".to_string(),
        start_block: 0,
        max_block_interval: 2000,
        contracts: vec![ContractConfig {
            name: "Ping".to_string(),
            address: AddressOrAddresses::Single(PING_ADDRESS),
            events: vec!["Ping(uint256 id)".to_string()],
        }],
    }
}

/// As [`ping_chain_config`], plus an address-less "Nft" contract type whose
/// addresses arrive via dynamic registration.
pub fn transfer_chain_config(chain_id: u64) -> ChainConfig {
    let mut chain = ping_chain_config(chain_id);
    chain.contracts.push(ContractConfig {
        name: "Nft".to_string(),
        address: AddressOrAddresses::Multiple(Vec::new()),
        events: vec![
            "Transfer(address indexed from, address indexed to, uint256 value)".to_string(),
        ],
    });
    chain
}

fn rpc_log(address: Address, topics: Vec<B256>, data: Vec<u8>, block_number: u64, log_index: u64) -> Log {
    Log {
        inner: alloy::primitives::Log {
            address,
            data: alloy::primitives::LogData::new_unchecked(topics, data.into()),
        },
        block_hash: Some(B256::repeat_byte(0xb1)),
        block_number: Some(block_number),
        block_timestamp: None,
        transaction_hash: Some(B256::repeat_byte(0xc1)),
        transaction_index: Some(0),
        log_index: Some(log_index),
        removed: false,
    }
}

pub fn ping_log(block_number: u64, log_index: u64, id: u64) -> Log {
    let event = ParsedEvent::from_signature("Ping(uint256 id)").expect("fixture signature");
    let data = DynSolValue::Tuple(vec![DynSolValue::Uint(U256::from(id), 256)])
        .abi_encode_sequence()
        .expect("fixture encoding");
    rpc_log(PING_ADDRESS, vec![event.topic0], data, block_number, log_index)
}

pub fn transfer_log(address: Address, block_number: u64, log_index: u64, value: u64) -> Log {
    let event = ParsedEvent::from_signature(
        "Transfer(address indexed from, address indexed to, uint256 value)",
    )
    .expect("fixture signature");
    let data = DynSolValue::Tuple(vec![DynSolValue::Uint(U256::from(value), 256)])
        .abi_encode_sequence()
        .expect("fixture encoding");
    rpc_log(
        address,
        vec![
            event.topic0,
            Address::repeat_byte(0xaa).into_word(),
            Address::repeat_byte(0xbb).into_word(),
        ],
        data,
        block_number,
        log_index,
    )
}

/// A queue item with only ordering-relevant fields populated.
pub fn bare_item(chain_id: u64, block_number: u64, log_index: u64, timestamp: u64) -> EventItem {
    EventItem {
        chain_id,
        event_id: EventItem::event_id_for(block_number, log_index),
        block_number,
        block_timestamp: timestamp,
        block_hash: B256::ZERO,
        transaction_hash: B256::ZERO,
        transaction_index: 0,
        log_index,
        contract_address: PING_ADDRESS,
        event: DecodedEvent {
            contract_type: "Ping".to_string(),
            event_name: "Ping".to_string(),
            params: Vec::new(),
        },
    }
}

/// Scriptable [`LogProvider`]: canned logs and block timestamps, a head
/// counter, an optional number of `getLogs` calls that hang forever, and a
/// record of every queried range.
pub struct MockProvider {
    head: Mutex<u64>,
    blocks: Mutex<HashMap<u64, u64>>,
    logs: Mutex<Vec<Log>>,
    hang_remaining: AtomicU32,
    calls: Mutex<Vec<(u64, u64)>>,
}

impl MockProvider {
    pub fn new(head: u64) -> Self {
        Self {
            head: Mutex::new(head),
            blocks: Mutex::new(HashMap::new()),
            logs: Mutex::new(Vec::new()),
            hang_remaining: AtomicU32::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_block_timestamps(
        &self,
        range: RangeInclusive<u64>,
        timestamp: impl Fn(u64) -> u64,
    ) {
        let mut blocks = self.blocks.lock();
        for number in range {
            blocks.insert(number, timestamp(number));
        }
    }

    pub fn add_log(&self, log: Log) {
        self.logs.lock().push(log);
    }

    pub fn set_head(&self, head: u64) {
        *self.head.lock() = head;
    }

    /// The next `count` `getLogs` calls never resolve, simulating a
    /// provider that stops responding.
    pub fn hang_next_get_logs(&self, count: u32) {
        self.hang_remaining.store(count, Ordering::SeqCst);
    }

    pub fn get_logs_calls(&self) -> Vec<(u64, u64)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl LogProvider for MockProvider {
    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, RpcError> {
        let from = filter
            .get_from_block()
            .ok_or_else(|| RpcError::Provider("missing from_block".to_string()))?;
        let to = filter
            .get_to_block()
            .ok_or_else(|| RpcError::Provider("missing to_block".to_string()))?;
        self.calls.lock().push((from, to));

        if self
            .hang_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            std::future::pending::<()>().await;
        }

        let mut logs: Vec<Log> = self
            .logs
            .lock()
            .iter()
            .filter(|log| {
                let number = log.block_number.unwrap_or_default();
                number >= from && number <= to && filter.address.matches(&log.inner.address)
            })
            .cloned()
            .collect();
        logs.sort_by_key(|log| (log.block_number, log.log_index));
        Ok(logs)
    }

    async fn get_block(&self, number: u64) -> Result<Block, RpcError> {
        match self.blocks.lock().get(&number) {
            Some(timestamp) => {
                let mut block = Block::default();
                block.header.inner.number = number;
                block.header.inner.timestamp = *timestamp;
                Ok(block)
            }
            None => Err(RpcError::NullBlock(number)),
        }
    }

    async fn get_block_number(&self) -> Result<u64, RpcError> {
        Ok(*self.head.lock())
    }
}
