//! Globally ordered merge across chains.
//!
//! The manager peeks every chain queue's front and the auxiliary heap and
//! always emits the earliest ordering key. A chain with an empty queue
//! reports how far it has fetched instead; an item is only emitted once its
//! key is strictly earlier than every such horizon, which is what makes the
//! merged stream globally ascending.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;

use alloy::primitives::Address;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;

use crate::types::event::{EventItem, OrderingKey};

use super::chain_fetcher::{ChainFetcher, FetchError};
use super::queue::{ChainQueue, Peeked};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("chain {0} is not configured")]
    UnknownChain(u64),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Min-heap of late-arriving items: dynamic-contract back-fills land here so
/// the per-chain queues stay monotone.
#[derive(Default)]
pub struct AuxQueue {
    heap: Mutex<BinaryHeap<Reverse<HeapEntry>>>,
}

struct HeapEntry(EventItem);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.ordering_key() == other.0.ordering_key()
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.ordering_key().cmp(&other.0.ordering_key())
    }
}

impl AuxQueue {
    pub fn push(&self, item: EventItem) {
        self.heap.lock().push(Reverse(HeapEntry(item)));
    }

    pub fn peek_key(&self) -> Option<OrderingKey> {
        self.heap.lock().peek().map(|entry| entry.0 .0.ordering_key())
    }

    pub fn pop(&self) -> Option<EventItem> {
        self.heap.lock().pop().map(|entry| entry.0 .0)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}

struct ChainHandle {
    fetcher: Arc<ChainFetcher>,
    queue: Arc<ChainQueue>,
    progress: watch::Receiver<u64>,
}

#[derive(Debug, Clone, Copy)]
enum Front {
    Item { chain_id: u64, key: OrderingKey },
    Gap { chain_id: u64, timestamp: u64 },
}

/// The earlier of two fronts under the merge comparator: items compare by
/// full ordering key; an item beats a gap only when its (timestamp, chain)
/// is strictly less than the gap's horizon.
fn earlier(a: Front, b: Front) -> Front {
    match (a, b) {
        (Front::Item { key: ka, .. }, Front::Item { key: kb, .. }) => {
            if ka <= kb {
                a
            } else {
                b
            }
        }
        (Front::Item { key, .. }, Front::Gap {
            chain_id,
            timestamp,
        }) => {
            if (key.block_timestamp, key.chain_id) < (timestamp, chain_id) {
                a
            } else {
                b
            }
        }
        (Front::Gap { .. }, Front::Item { .. }) => earlier(b, a),
        (
            Front::Gap {
                chain_id: ca,
                timestamp: ta,
            },
            Front::Gap {
                chain_id: cb,
                timestamp: tb,
            },
        ) => {
            if (ta, ca) <= (tb, cb) {
                a
            } else {
                b
            }
        }
    }
}

pub struct ChainManager {
    chains: BTreeMap<u64, ChainHandle>,
    aux: Arc<AuxQueue>,
}

impl ChainManager {
    pub fn new(fetchers: Vec<Arc<ChainFetcher>>, aux: Arc<AuxQueue>) -> Self {
        let chains = fetchers
            .into_iter()
            .map(|fetcher| {
                let queue = fetcher.queue().clone();
                let progress = queue.subscribe();
                (
                    fetcher.chain_id(),
                    ChainHandle {
                        fetcher,
                        queue,
                        progress,
                    },
                )
            })
            .collect();
        Self { chains, aux }
    }

    pub fn aux(&self) -> &Arc<AuxQueue> {
        &self.aux
    }

    fn earliest_front(&self) -> Option<Front> {
        self.chains
            .values()
            .map(|handle| match handle.queue.peek_front() {
                Peeked::Item(key) => Front::Item {
                    chain_id: key.chain_id,
                    key,
                },
                Peeked::NoItem {
                    latest_fetched_timestamp,
                    chain_id,
                } => Front::Gap {
                    chain_id,
                    timestamp: latest_fetched_timestamp,
                },
            })
            .reduce(earlier)
    }

    /// The earliest item available right now, or `None` when no item can be
    /// emitted without violating global order.
    pub fn pop_sync(&self) -> Option<EventItem> {
        let aux_key = self.aux.peek_key();
        match self.earliest_front() {
            Some(Front::Item { chain_id, key }) => {
                if aux_key.is_some_and(|ak| ak < key) {
                    self.aux.pop()
                } else {
                    self.chains
                        .get(&chain_id)
                        .and_then(|handle| handle.queue.pop())
                }
            }
            Some(Front::Gap {
                chain_id,
                timestamp,
            }) => match aux_key {
                Some(ak) if (ak.block_timestamp, ak.chain_id) < (timestamp, chain_id) => {
                    self.aux.pop()
                }
                _ => None,
            },
            None => self.aux.pop(),
        }
    }

    /// As [`pop_sync`], but suspends on the blocking chain's "new range
    /// queried" signal until an item can be emitted.
    ///
    /// [`pop_sync`]: ChainManager::pop_sync
    pub async fn pop_async(&mut self) -> EventItem {
        loop {
            if let Some(item) = self.pop_sync() {
                return item;
            }
            let gap_chain = match self.earliest_front() {
                Some(Front::Gap { chain_id, .. }) => chain_id,
                // A push landed between the failed pop and this peek.
                Some(Front::Item { .. }) => continue,
                None => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            };
            let handle = self
                .chains
                .get_mut(&gap_chain)
                .expect("front came from a configured chain");
            if handle.progress.changed().await.is_err() {
                // The fetcher is gone, so this horizon will never advance.
                // The caller observes the dead task; park here.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Collect at least `min` items (suspending as needed), then drain
    /// whatever more is synchronously available up to `max`.
    pub async fn make_batch(&mut self, min: usize, max: usize) -> Vec<EventItem> {
        let mut batch = Vec::with_capacity(min.max(1));
        while batch.len() < min {
            batch.push(self.pop_async().await);
        }
        while batch.len() < max {
            match self.pop_sync() {
                Some(item) => batch.push(item),
                None => break,
            }
        }
        batch
    }

    /// Make `address` a fetch target on `chain_id`. Blocks already fetched
    /// by that chain are back-filled into the auxiliary queue before this
    /// returns, so subsequent pops merge the late items at their correct
    /// ordering keys.
    pub async fn register_dynamic_contract(
        &self,
        chain_id: u64,
        address: Address,
        contract_type: &str,
        registered_at_block: u64,
    ) -> Result<(), ManagerError> {
        let handle = self
            .chains
            .get(&chain_id)
            .ok_or(ManagerError::UnknownChain(chain_id))?;
        handle
            .fetcher
            .register_contract(address, contract_type, registered_at_block)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::time::Duration;

    use proptest::prelude::*;

    use crate::decoding::EventDecoderRegistry;
    use crate::types::config::sync::SyncConfig;

    use super::super::testing::{
        bare_item, ping_chain_config, ping_log, transfer_chain_config, transfer_log,
        MockProvider, PING_ADDRESS,
    };
    use super::*;

    fn spawn_fetcher(
        chain_id: u64,
        provider: Arc<MockProvider>,
        registry: Arc<EventDecoderRegistry>,
        shutdown: Arc<AtomicBool>,
        aux: Arc<AuxQueue>,
    ) -> Arc<ChainFetcher> {
        let sync = SyncConfig {
            head_poll_millis: 10,
            ..SyncConfig::default()
        };
        let fetcher = Arc::new(ChainFetcher::new(
            chain_id,
            0,
            2000,
            provider,
            registry,
            Arc::new(ChainQueue::new(chain_id, 1024)),
            aux,
            sync,
            shutdown,
        ));
        let runner = fetcher.clone();
        tokio::spawn(async move { runner.run().await });
        fetcher
    }

    #[tokio::test(start_paused = true)]
    async fn test_cross_chain_ordering() {
        // Chain 1 emits at timestamps 10 and 30, chain 2 twice at 20.
        let provider1 = Arc::new(MockProvider::new(10));
        provider1.set_block_timestamps(0..=10, |n| n * 10);
        provider1.add_log(ping_log(1, 0, 1));
        provider1.add_log(ping_log(3, 0, 2));

        let provider2 = Arc::new(MockProvider::new(10));
        provider2.set_block_timestamps(0..=10, |n| n * 10);
        provider2.add_log(ping_log(2, 0, 3));
        provider2.add_log(ping_log(2, 1, 4));

        let registry = Arc::new(
            EventDecoderRegistry::from_config(&[ping_chain_config(1), ping_chain_config(2)])
                .unwrap(),
        );
        let shutdown = Arc::new(AtomicBool::new(false));
        let aux = Arc::new(AuxQueue::default());
        let fetchers = vec![
            spawn_fetcher(1, provider1, registry.clone(), shutdown.clone(), aux.clone()),
            spawn_fetcher(2, provider2, registry, shutdown.clone(), aux.clone()),
        ];
        let mut manager = ChainManager::new(fetchers, aux);

        let batch = manager.make_batch(4, 10).await;
        shutdown.store(true, AtomicOrdering::Relaxed);

        let emitted: Vec<(u64, u64, u64)> = batch
            .iter()
            .map(|item| (item.chain_id, item.block_timestamp, item.log_index))
            .collect();
        assert_eq!(emitted, vec![(1, 10, 0), (2, 20, 0), (2, 20, 1), (1, 30, 0)]);

        // The multiset of outputs equals the multiset of inputs.
        let mut keys: Vec<OrderingKey> = batch.iter().map(EventItem::ordering_key).collect();
        let sorted = {
            let mut s = keys.clone();
            s.sort_unstable();
            s
        };
        assert_eq!(keys, sorted);
        keys.dedup();
        assert_eq!(keys.len(), 4);
    }

    #[tokio::test]
    async fn test_pop_sync_blocked_by_lagging_horizon() {
        let registry = Arc::new(
            EventDecoderRegistry::from_config(&[ping_chain_config(1), ping_chain_config(2)])
                .unwrap(),
        );
        let shutdown = Arc::new(AtomicBool::new(false));
        let aux = Arc::new(AuxQueue::default());
        // Fetchers constructed but never run: queues are driven by hand.
        let make = |chain_id: u64| {
            Arc::new(ChainFetcher::new(
                chain_id,
                0,
                2000,
                Arc::new(MockProvider::new(0)),
                registry.clone(),
                Arc::new(ChainQueue::new(chain_id, 16)),
                aux.clone(),
                SyncConfig::default(),
                shutdown.clone(),
            ))
        };
        let fetchers = vec![make(1), make(2)];
        let queue1 = fetchers[0].queue().clone();
        let queue2 = fetchers[1].queue().clone();
        let manager = ChainManager::new(fetchers, aux);

        queue1.push(bare_item(1, 3, 0, 30)).await;
        queue1.mark_range_fetched(3, 30);

        // Chain 2 has fetched nothing: its horizon (0) precedes the item.
        assert!(manager.pop_sync().is_none());

        queue2.mark_range_fetched(5, 20);
        // Horizon 20 still precedes timestamp 30.
        assert!(manager.pop_sync().is_none());

        queue2.mark_range_fetched(9, 40);
        let item = manager.pop_sync().expect("item is now safe to emit");
        assert_eq!(item.block_timestamp, 30);
        assert!(manager.pop_sync().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_async_waits_for_horizon_advance() {
        let registry = Arc::new(EventDecoderRegistry::from_config(&[ping_chain_config(1)]).unwrap());
        let shutdown = Arc::new(AtomicBool::new(false));
        let aux = Arc::new(AuxQueue::default());
        let fetcher = Arc::new(ChainFetcher::new(
            1,
            0,
            2000,
            Arc::new(MockProvider::new(0)),
            registry,
            Arc::new(ChainQueue::new(1, 16)),
            aux.clone(),
            SyncConfig::default(),
            shutdown,
        ));
        let queue = fetcher.queue().clone();
        let mut manager = ChainManager::new(vec![fetcher], aux);

        let waiter = tokio::spawn(async move {
            let item = manager.pop_async().await;
            item.block_timestamp
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        queue.push(bare_item(1, 1, 0, 10)).await;
        assert_eq!(waiter.await.unwrap(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dynamic_contract_backfill_merges_through_aux_queue() {
        // The chain is at block 1000; a token deployed at block 500 emitted
        // transfers at 500 and 800 before anyone watched it.
        let provider = Arc::new(MockProvider::new(1000));
        provider.set_block_timestamps(0..=1000, |n| n);
        let nft = Address::repeat_byte(0x77);
        provider.add_log(transfer_log(nft, 500, 0, 1));
        provider.add_log(transfer_log(nft, 800, 0, 2));
        // A regular event after the backfill range.
        provider.add_log(ping_log(900, 0, 9));

        let registry = Arc::new(
            EventDecoderRegistry::from_config(&[transfer_chain_config(1)]).unwrap(),
        );
        let shutdown = Arc::new(AtomicBool::new(false));
        let aux = Arc::new(AuxQueue::default());
        let fetcher = spawn_fetcher(1, provider.clone(), registry, shutdown.clone(), aux.clone());
        let queue = fetcher.queue().clone();
        let mut manager = ChainManager::new(vec![fetcher], aux);

        // Wait until the fetcher has covered the chain head.
        while queue.latest_fetched_block() < 1000 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        manager
            .register_dynamic_contract(1, nft, "Nft", 500)
            .await
            .unwrap();
        assert_eq!(manager.aux().len(), 2);

        let batch = manager.make_batch(3, 10).await;
        shutdown.store(true, AtomicOrdering::Relaxed);

        let emitted: Vec<(u64, &str)> = batch
            .iter()
            .map(|item| (item.block_number, item.event.event_name.as_str()))
            .collect();
        assert_eq!(
            emitted,
            vec![(500, "Transfer"), (800, "Transfer"), (900, "Ping")]
        );
    }

    #[tokio::test]
    async fn test_register_on_unknown_chain_fails() {
        let registry = Arc::new(EventDecoderRegistry::from_config(&[ping_chain_config(1)]).unwrap());
        let fetcher = Arc::new(ChainFetcher::new(
            1,
            0,
            2000,
            Arc::new(MockProvider::new(0)),
            registry,
            Arc::new(ChainQueue::new(1, 16)),
            Arc::new(AuxQueue::default()),
            SyncConfig::default(),
            Arc::new(AtomicBool::new(false)),
        ));
        let manager = ChainManager::new(vec![fetcher], Arc::new(AuxQueue::default()));
        assert!(matches!(
            manager
                .register_dynamic_contract(42, PING_ADDRESS, "Ping", 0)
                .await,
            Err(ManagerError::UnknownChain(42))
        ));
    }

    proptest! {
        // The aux heap emits any multiset of items in ascending key order.
        #[test]
        fn prop_aux_queue_pops_sorted(
            raw in prop::collection::vec((0u64..100, 1u64..4, 0u64..1000, 0u64..10), 1..50)
        ) {
            let aux = AuxQueue::default();
            let mut expected: Vec<OrderingKey> = Vec::new();
            for (ts, chain, block, log) in raw {
                let item = bare_item(chain, block, log, ts);
                expected.push(item.ordering_key());
                aux.push(item);
            }
            expected.sort_unstable();

            let mut popped = Vec::new();
            while let Some(item) = aux.pop() {
                popped.push(item.ordering_key());
            }
            prop_assert_eq!(popped, expected);
        }
    }
}
