//! Per-chain sliding-window log fetcher.
//!
//! Each chain runs one fetcher task. The loop queries `getLogs` for a window
//! of blocks, decodes the results, resolves block timestamps (at most one
//! `getBlock` per distinct block, memoised per window), and pushes items
//! onto the chain's bounded queue in log order. RPC failures and timeouts
//! are retried indefinitely: the same window is re-queried after a fixed
//! delay with a multiplicatively shrunken interval, and the interval grows
//! back additively on success.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use alloy::rpc::types::{Filter, Log};
use thiserror::Error;
use tokio::time::timeout;

use crate::decoding::registry::{DecodeError, EventDecoderRegistry, RawLog};
use crate::rpc::LogProvider;
use crate::types::config::sync::SyncConfig;
use crate::types::event::EventItem;

use super::manager::AuxQueue;
use super::queue::ChainQueue;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

struct Window {
    items: Vec<EventItem>,
    to_timestamp: u64,
}

enum Built {
    Item(Box<EventItem>),
    /// Log not declared in the registry; skipped and counted there.
    Skipped,
    /// Missing provider metadata or an unresolvable block; the whole
    /// window must be re-queried.
    Retry,
}

pub struct ChainFetcher {
    chain_id: u64,
    start_block: u64,
    max_block_interval: u64,
    provider: Arc<dyn LogProvider>,
    registry: Arc<EventDecoderRegistry>,
    queue: Arc<ChainQueue>,
    aux: Arc<AuxQueue>,
    sync: SyncConfig,
    shutdown: Arc<AtomicBool>,
}

impl ChainFetcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_id: u64,
        start_block: u64,
        max_block_interval: u64,
        provider: Arc<dyn LogProvider>,
        registry: Arc<EventDecoderRegistry>,
        queue: Arc<ChainQueue>,
        aux: Arc<AuxQueue>,
        sync: SyncConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            chain_id,
            start_block,
            max_block_interval: max_block_interval.max(1),
            provider,
            registry,
            queue,
            aux,
            sync,
            shutdown,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn queue(&self) -> &Arc<ChainQueue> {
        &self.queue
    }

    pub async fn run(&self) -> Result<(), FetchError> {
        let mut from = self.start_block;
        let mut interval = self.max_block_interval;
        let Some(mut head) = self.chain_head().await else {
            return Ok(());
        };

        tracing::info!(
            chain_id = self.chain_id,
            head,
            from,
            interval,
            "starting fetch loop"
        );

        while !self.shutdown.load(Ordering::Relaxed) {
            if from > head {
                tokio::time::sleep(Duration::from_millis(self.sync.head_poll_millis)).await;
                match self.chain_head().await {
                    Some(new_head) => head = new_head,
                    None => break,
                }
                continue;
            }

            let to = (from + interval - 1).min(head);
            match self.fetch_window(from, to).await? {
                Some(window) => {
                    let count = window.items.len();
                    for item in window.items {
                        self.queue.push(item).await;
                    }
                    self.queue.mark_range_fetched(to, window.to_timestamp);
                    tracing::debug!(
                        chain_id = self.chain_id,
                        from,
                        to,
                        count,
                        skipped = self.registry.skipped_logs(),
                        "queried range"
                    );
                    from = to + 1;
                    interval =
                        (interval + self.sync.acceleration_additive).min(self.max_block_interval);
                }
                None => {
                    tokio::time::sleep(Duration::from_millis(self.sync.backoff_millis)).await;
                    interval = shrink_interval(interval, self.sync.backoff_multiplicative);
                }
            }
        }

        tracing::info!(chain_id = self.chain_id, "fetch loop stopped");
        Ok(())
    }

    /// Widen the filter set with a dynamically registered address. When the
    /// chain has already fetched past the registration block, the missed
    /// range is back-filled immediately and the decoded items go to the
    /// auxiliary queue, keeping the per-chain queue monotone.
    pub async fn register_contract(
        &self,
        address: Address,
        contract_type: &str,
        registered_at_block: u64,
    ) -> Result<(), FetchError> {
        let added = self
            .registry
            .add_contract(self.chain_id, address, contract_type)?;
        if !added {
            tracing::debug!(
                chain_id = self.chain_id,
                %address,
                contract_type,
                "contract already registered"
            );
            return Ok(());
        }

        let latest = self.queue.latest_fetched_block();
        if registered_at_block > latest {
            return Ok(());
        }

        tracing::info!(
            chain_id = self.chain_id,
            %address,
            contract_type,
            from = registered_at_block,
            to = latest,
            "back-filling dynamically registered contract"
        );
        self.backfill(address, registered_at_block, latest).await
    }

    /// One `getLogs` window. `Ok(None)` is a transient failure; the caller
    /// backs off and re-queries the same window.
    async fn fetch_window(&self, from: u64, to: u64) -> Result<Option<Window>, FetchError> {
        let filter = Filter::new()
            .address(self.registry.addresses_for_chain(self.chain_id))
            .event_signature(self.registry.topics_for_chain(self.chain_id))
            .from_block(from)
            .to_block(to);

        let Some(logs) = self.query_logs(&filter, from, to).await else {
            return Ok(None);
        };

        let mut timestamps = HashMap::new();
        let mut items = Vec::with_capacity(logs.len());
        for log in &logs {
            match self.build_item(log, &mut timestamps).await? {
                Built::Item(item) => items.push(*item),
                Built::Skipped => {}
                Built::Retry => return Ok(None),
            }
        }

        let Some(to_timestamp) = self.block_timestamp(to, &mut timestamps).await else {
            return Ok(None);
        };

        Ok(Some(Window {
            items,
            to_timestamp,
        }))
    }

    async fn backfill(&self, address: Address, from: u64, to: u64) -> Result<(), FetchError> {
        let mut interval = self.max_block_interval;
        let mut cursor = from;

        while cursor <= to && !self.shutdown.load(Ordering::Relaxed) {
            let window_to = (cursor + interval - 1).min(to);
            let filter = Filter::new()
                .address(address)
                .from_block(cursor)
                .to_block(window_to);

            let Some(logs) = self.query_logs(&filter, cursor, window_to).await else {
                tokio::time::sleep(Duration::from_millis(self.sync.backoff_millis)).await;
                interval = shrink_interval(interval, self.sync.backoff_multiplicative);
                continue;
            };

            let mut timestamps = HashMap::new();
            let mut items = Vec::with_capacity(logs.len());
            let mut incomplete = false;
            for log in &logs {
                match self.build_item(log, &mut timestamps).await? {
                    Built::Item(item) => items.push(*item),
                    Built::Skipped => {}
                    Built::Retry => {
                        incomplete = true;
                        break;
                    }
                }
            }
            if incomplete {
                tokio::time::sleep(Duration::from_millis(self.sync.backoff_millis)).await;
                interval = shrink_interval(interval, self.sync.backoff_multiplicative);
                continue;
            }

            let count = items.len();
            for item in items {
                self.aux.push(item);
            }
            tracing::debug!(
                chain_id = self.chain_id,
                from = cursor,
                to = window_to,
                count,
                "back-filled range"
            );
            cursor = window_to + 1;
        }

        Ok(())
    }

    async fn query_logs(&self, filter: &Filter, from: u64, to: u64) -> Option<Vec<Log>> {
        let budget = Duration::from_millis(self.sync.query_timeout_millis);
        match timeout(budget, self.provider.get_logs(filter)).await {
            Ok(Ok(logs)) => Some(logs),
            Ok(Err(err)) => {
                tracing::warn!(
                    chain_id = self.chain_id,
                    from,
                    to,
                    error = %err,
                    "getLogs failed, backing off"
                );
                None
            }
            Err(_) => {
                tracing::warn!(
                    chain_id = self.chain_id,
                    from,
                    to,
                    budget_ms = self.sync.query_timeout_millis,
                    "getLogs timed out, backing off"
                );
                None
            }
        }
    }

    /// Decode one log into a queue item. Decoding failures for declared
    /// topics are fatal; everything else either skips the log or retries
    /// the window.
    async fn build_item(
        &self,
        log: &Log,
        timestamps: &mut HashMap<u64, u64>,
    ) -> Result<Built, FetchError> {
        let raw = RawLog {
            address: log.inner.address,
            topics: log.inner.data.topics().to_vec(),
            data: log.inner.data.data.to_vec(),
        };
        let Some(event) = self.registry.decode(self.chain_id, &raw)? else {
            return Ok(Built::Skipped);
        };

        let (Some(block_number), Some(log_index)) = (log.block_number, log.log_index) else {
            tracing::warn!(
                chain_id = self.chain_id,
                "provider returned a log without block metadata"
            );
            return Ok(Built::Retry);
        };
        let Some(block_timestamp) = self.block_timestamp(block_number, timestamps).await else {
            return Ok(Built::Retry);
        };

        Ok(Built::Item(Box::new(EventItem {
            chain_id: self.chain_id,
            event_id: EventItem::event_id_for(block_number, log_index),
            block_number,
            block_timestamp,
            block_hash: log.block_hash.unwrap_or_default(),
            transaction_hash: log.transaction_hash.unwrap_or_default(),
            transaction_index: log.transaction_index.unwrap_or_default(),
            log_index,
            contract_address: raw.address,
            event,
        })))
    }

    async fn block_timestamp(
        &self,
        number: u64,
        timestamps: &mut HashMap<u64, u64>,
    ) -> Option<u64> {
        if let Some(ts) = timestamps.get(&number) {
            return Some(*ts);
        }
        match self.provider.get_block(number).await {
            Ok(block) => {
                let ts = block.header.timestamp;
                timestamps.insert(number, ts);
                Some(ts)
            }
            Err(err) => {
                tracing::warn!(
                    chain_id = self.chain_id,
                    block = number,
                    error = %err,
                    "getBlock failed, backing off"
                );
                None
            }
        }
    }

    async fn chain_head(&self) -> Option<u64> {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return None;
            }
            match self.provider.get_block_number().await {
                Ok(head) => return Some(head),
                Err(err) => {
                    tracing::warn!(
                        chain_id = self.chain_id,
                        error = %err,
                        "get_block_number failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(self.sync.backoff_millis)).await;
                }
            }
        }
    }
}

fn shrink_interval(interval: u64, multiplier: f64) -> u64 {
    ((interval as f64 * multiplier).floor() as u64).max(1)
}
