//! Routing of raw logs to typed, decoded events.
//!
//! The registry is built once from configuration. The only mutation it ever
//! sees afterwards is a pure addition: the dynamic contract registrar binding
//! a new address to an already-declared contract type.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use alloy::dyn_abi::{DynSolType, DynSolValue};
use alloy::primitives::{Address, B256, I256, U256};
use parking_lot::RwLock;
use thiserror::Error;

use crate::types::config::chain::ChainConfig;

use super::event_parsing::{EventParam, EventParseError, ParsedEvent, TupleFieldInfo};
use super::types::{DecodedEvent, DecodedValue};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Parse(#[from] EventParseError),

    #[error("unknown contract type {contract_type} on chain {chain_id}")]
    UnknownContractType { chain_id: u64, contract_type: String },

    #[error("log for {event} on chain {chain_id} is missing topic {index}")]
    MissingTopic {
        chain_id: u64,
        event: String,
        index: usize,
    },

    #[error("failed to decode {event} payload on chain {chain_id}: {reason}")]
    Payload {
        chain_id: u64,
        event: String,
        reason: String,
    },
}

/// The log fields the decoder needs.
#[derive(Debug, Clone)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct ContractTemplate {
    contract_type: String,
    events: HashMap<B256, ParsedEvent>,
}

/// Maps (chain id, contract address, topic0) to a decoded event.
pub struct EventDecoderRegistry {
    /// Declared contract types per chain, keyed by (chain_id, type name).
    templates: HashMap<(u64, String), Arc<ContractTemplate>>,
    /// Address book: which template a log-emitting address belongs to.
    addresses: RwLock<HashMap<(u64, Address), Arc<ContractTemplate>>>,
    /// Logs skipped because their address or topic is not declared.
    skipped_logs: AtomicU64,
}

impl EventDecoderRegistry {
    pub fn from_config(chains: &[ChainConfig]) -> Result<Self, DecodeError> {
        let mut templates = HashMap::new();
        let mut addresses = HashMap::new();

        for chain in chains {
            for contract in &chain.contracts {
                let mut events = HashMap::new();
                for signature in &contract.events {
                    let parsed = ParsedEvent::from_signature(signature)?;
                    events.insert(parsed.topic0, parsed);
                }
                let template = Arc::new(ContractTemplate {
                    contract_type: contract.name.clone(),
                    events,
                });
                for address in contract.address.iter() {
                    addresses.insert((chain.chain_id, address), template.clone());
                }
                templates.insert((chain.chain_id, contract.name.clone()), template);
            }
        }

        Ok(Self {
            templates,
            addresses: RwLock::new(addresses),
            skipped_logs: AtomicU64::new(0),
        })
    }

    /// Bind an address to a declared contract type. Returns false when the
    /// address was already registered.
    pub fn add_contract(
        &self,
        chain_id: u64,
        address: Address,
        contract_type: &str,
    ) -> Result<bool, DecodeError> {
        let template = self
            .templates
            .get(&(chain_id, contract_type.to_string()))
            .ok_or_else(|| DecodeError::UnknownContractType {
                chain_id,
                contract_type: contract_type.to_string(),
            })?
            .clone();

        let mut addresses = self.addresses.write();
        if addresses.contains_key(&(chain_id, address)) {
            return Ok(false);
        }
        addresses.insert((chain_id, address), template);
        Ok(true)
    }

    /// Current fetch targets for a chain.
    pub fn addresses_for_chain(&self, chain_id: u64) -> Vec<Address> {
        let mut out: Vec<Address> = self
            .addresses
            .read()
            .keys()
            .filter(|(chain, _)| *chain == chain_id)
            .map(|(_, address)| *address)
            .collect();
        out.sort_unstable();
        out
    }

    /// Every declared topic0 on a chain, for the `getLogs` topic filter.
    pub fn topics_for_chain(&self, chain_id: u64) -> Vec<B256> {
        let mut out: Vec<B256> = self
            .templates
            .iter()
            .filter(|((chain, _), _)| *chain == chain_id)
            .flat_map(|(_, template)| template.events.keys().copied())
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    pub fn skipped_logs(&self) -> u64 {
        self.skipped_logs.load(Ordering::Relaxed)
    }

    /// Decode a log. `None` means the address or topic is not declared and
    /// the log is skipped; an error means a declared event failed to decode,
    /// which indicates ABI drift and is fatal.
    pub fn decode(
        &self,
        chain_id: u64,
        log: &RawLog,
    ) -> Result<Option<DecodedEvent>, DecodeError> {
        let template = match self.addresses.read().get(&(chain_id, log.address)) {
            Some(template) => template.clone(),
            None => {
                self.skipped_logs.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        };

        let Some(topic0) = log.topics.first() else {
            self.skipped_logs.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        let Some(event) = template.events.get(topic0) else {
            self.skipped_logs.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let params = decode_log(chain_id, log, event)?;
        Ok(Some(DecodedEvent {
            contract_type: template.contract_type.clone(),
            event_name: event.name.clone(),
            params,
        }))
    }
}

/// Decode a log's topics and data into named values in declaration order.
fn decode_log(
    chain_id: u64,
    log: &RawLog,
    event: &ParsedEvent,
) -> Result<Vec<(String, DecodedValue)>, DecodeError> {
    // Indexed parameters live in topics[1..].
    let mut indexed_values = Vec::new();
    for (i, param) in event.indexed_params().enumerate() {
        let topic = log
            .topics
            .get(i + 1)
            .ok_or_else(|| DecodeError::MissingTopic {
                chain_id,
                event: event.name.clone(),
                index: i + 1,
            })?;
        indexed_values.push(decode_topic(topic, param));
    }

    // Non-indexed parameters are ABI-encoded together in the data section.
    let data_params: Vec<&EventParam> = event.data_params().collect();
    let mut data_values = Vec::new();
    if !data_params.is_empty() {
        let tuple_type =
            DynSolType::Tuple(data_params.iter().map(|p| p.param_type.clone()).collect());
        let decoded = tuple_type
            .abi_decode_sequence(&log.data)
            .map_err(|e| DecodeError::Payload {
                chain_id,
                event: event.name.clone(),
                reason: e.to_string(),
            })?;
        let DynSolValue::Tuple(values) = decoded else {
            return Err(DecodeError::Payload {
                chain_id,
                event: event.name.clone(),
                reason: "data did not decode to a tuple".to_string(),
            });
        };
        for (value, param) in values.iter().zip(data_params.iter()) {
            data_values.push(convert_value(value, &param.tuple_fields).map_err(|reason| {
                DecodeError::Payload {
                    chain_id,
                    event: event.name.clone(),
                    reason,
                }
            })?);
        }
    }

    // Reassemble in declaration order.
    let mut indexed_iter = indexed_values.into_iter();
    let mut data_iter = data_values.into_iter();
    let mut params = Vec::with_capacity(event.params.len());
    for (i, param) in event.params.iter().enumerate() {
        let value = if param.indexed {
            indexed_iter.next()
        } else {
            data_iter.next()
        }
        .ok_or_else(|| DecodeError::Payload {
            chain_id,
            event: event.name.clone(),
            reason: format!("parameter count mismatch at {i}"),
        })?;
        let name = if param.name.is_empty() {
            format!("param_{i}")
        } else {
            param.name.clone()
        };
        params.push((name, value));
    }

    Ok(params)
}

/// A topic holds either the value itself (static types) or the keccak hash
/// of the value (dynamic types, including indexed tuples).
fn decode_topic(topic: &B256, param: &EventParam) -> DecodedValue {
    if matches!(param.tuple_fields, Some(TupleFieldInfo::Tuple(_))) {
        return DecodedValue::Word(*topic);
    }
    match &param.param_type {
        DynSolType::Address => DecodedValue::Addr(Address::from_word(*topic)),
        DynSolType::Uint(_) => DecodedValue::Uint(U256::from_be_bytes(topic.0)),
        DynSolType::Int(_) => DecodedValue::Int(I256::from_raw(U256::from_be_bytes(topic.0))),
        DynSolType::Bool => DecodedValue::Bool(topic.0[31] != 0),
        _ => DecodedValue::Word(*topic),
    }
}

fn convert_value(
    value: &DynSolValue,
    tuple_fields: &Option<TupleFieldInfo>,
) -> Result<DecodedValue, String> {
    match (value, tuple_fields) {
        (DynSolValue::Tuple(values), Some(TupleFieldInfo::Tuple(field_infos))) => {
            let mut fields = Vec::with_capacity(values.len());
            for ((name, info), value) in field_infos.iter().zip(values.iter()) {
                fields.push((name.clone(), convert_value(value, &Some(info.clone()))?));
            }
            Ok(DecodedValue::Tuple(fields))
        }
        _ => convert_plain_value(value),
    }
}

fn convert_plain_value(value: &DynSolValue) -> Result<DecodedValue, String> {
    match value {
        DynSolValue::Address(addr) => Ok(DecodedValue::Addr(*addr)),
        DynSolValue::Uint(v, _) => Ok(DecodedValue::Uint(*v)),
        DynSolValue::Int(v, _) => Ok(DecodedValue::Int(*v)),
        DynSolValue::Bool(b) => Ok(DecodedValue::Bool(*b)),
        DynSolValue::FixedBytes(word, 32) => Ok(DecodedValue::Word(*word)),
        DynSolValue::FixedBytes(word, n) => Ok(DecodedValue::Bytes(word[..*n].to_vec())),
        DynSolValue::Bytes(bytes) => Ok(DecodedValue::Bytes(bytes.clone())),
        DynSolValue::String(s) => Ok(DecodedValue::Str(s.clone())),
        DynSolValue::Tuple(values) => {
            let fields = values
                .iter()
                .enumerate()
                .map(|(i, v)| Ok((format!("field_{i}"), convert_plain_value(v)?)))
                .collect::<Result<Vec<_>, String>>()?;
            Ok(DecodedValue::Tuple(fields))
        }
        DynSolValue::Array(values) | DynSolValue::FixedArray(values) => {
            let items = values
                .iter()
                .map(convert_plain_value)
                .collect::<Result<Vec<_>, String>>()?;
            Ok(DecodedValue::Array(items))
        }
        other => Err(format!("unsupported value type: {other:?}")),
    }
}
