//! Bounded per-chain queues feeding the global merge.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};

use crate::types::event::{EventItem, OrderingKey};

/// What the merge sees when it peeks a chain's queue head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peeked {
    /// The ordering key of the next queued item.
    Item(OrderingKey),
    /// Nothing queued. The chain has fetched every block up to this
    /// timestamp, so it has nothing to offer before it.
    NoItem {
        latest_fetched_timestamp: u64,
        chain_id: u64,
    },
}

/// FIFO of decoded items for one chain.
///
/// Capacity is enforced with a semaphore: `push` suspends while the queue is
/// full, which backpressures the fetcher against a slow consumer. The `watch`
/// channel signals "a new range was queried" so the merge can wait on a
/// specific chain instead of polling.
pub struct ChainQueue {
    chain_id: u64,
    items: Mutex<VecDeque<EventItem>>,
    slots: Semaphore,
    latest_fetched_timestamp: AtomicU64,
    latest_fetched_block: AtomicU64,
    progress_tx: watch::Sender<u64>,
}

impl ChainQueue {
    pub fn new(chain_id: u64, capacity: usize) -> Self {
        let (progress_tx, _) = watch::channel(0);
        Self {
            chain_id,
            items: Mutex::new(VecDeque::new()),
            slots: Semaphore::new(capacity),
            latest_fetched_timestamp: AtomicU64::new(0),
            latest_fetched_block: AtomicU64::new(0),
            progress_tx,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Enqueue an item, suspending while the queue is at capacity.
    pub async fn push(&self, item: EventItem) {
        let permit = self
            .slots
            .acquire()
            .await
            .expect("queue semaphore is never closed");
        permit.forget();
        self.items.lock().push_back(item);
        self.progress_tx.send_modify(|version| *version += 1);
    }

    pub fn pop(&self) -> Option<EventItem> {
        let item = self.items.lock().pop_front();
        if item.is_some() {
            self.slots.add_permits(1);
        }
        item
    }

    pub fn peek_front(&self) -> Peeked {
        match self.items.lock().front() {
            Some(item) => Peeked::Item(item.ordering_key()),
            None => Peeked::NoItem {
                latest_fetched_timestamp: self.latest_fetched_timestamp.load(Ordering::Acquire),
                chain_id: self.chain_id,
            },
        }
    }

    /// Record that the fetcher finished a window ending at `block` whose last
    /// block has `timestamp`. Advances the horizon even for empty windows.
    pub fn mark_range_fetched(&self, block: u64, timestamp: u64) {
        self.latest_fetched_block.store(block, Ordering::Release);
        self.latest_fetched_timestamp
            .store(timestamp, Ordering::Release);
        self.progress_tx.send_modify(|version| *version += 1);
    }

    pub fn latest_fetched_block(&self) -> u64 {
        self.latest_fetched_block.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.progress_tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use alloy::primitives::{Address, B256};

    use crate::decoding::types::DecodedEvent;

    use super::*;

    fn item(chain_id: u64, block_number: u64, log_index: u64, ts: u64) -> EventItem {
        EventItem {
            chain_id,
            event_id: EventItem::event_id_for(block_number, log_index),
            block_number,
            block_timestamp: ts,
            block_hash: B256::ZERO,
            transaction_hash: B256::ZERO,
            transaction_index: 0,
            log_index,
            contract_address: Address::ZERO,
            event: DecodedEvent {
                contract_type: "T".to_string(),
                event_name: "E".to_string(),
                params: Vec::new(),
            },
        }
    }

    #[tokio::test]
    async fn test_fifo_order_and_peek() {
        let queue = ChainQueue::new(1, 16);
        queue.push(item(1, 5, 0, 100)).await;
        queue.push(item(1, 5, 1, 100)).await;

        assert_eq!(
            queue.peek_front(),
            Peeked::Item(OrderingKey {
                block_timestamp: 100,
                chain_id: 1,
                block_number: 5,
                log_index: 0,
            })
        );
        assert_eq!(queue.pop().unwrap().log_index, 0);
        assert_eq!(queue.pop().unwrap().log_index, 1);
        assert!(queue.pop().is_none());
    }

    #[tokio::test]
    async fn test_empty_peek_reports_horizon() {
        let queue = ChainQueue::new(7, 16);
        assert_eq!(
            queue.peek_front(),
            Peeked::NoItem {
                latest_fetched_timestamp: 0,
                chain_id: 7,
            }
        );
        queue.mark_range_fetched(2000, 12345);
        assert_eq!(
            queue.peek_front(),
            Peeked::NoItem {
                latest_fetched_timestamp: 12345,
                chain_id: 7,
            }
        );
        assert_eq!(queue.latest_fetched_block(), 2000);
    }

    #[tokio::test]
    async fn test_push_blocks_at_capacity_until_pop() {
        let queue = Arc::new(ChainQueue::new(1, 1));
        queue.push(item(1, 1, 0, 10)).await;

        let queue2 = queue.clone();
        let blocked = tokio::spawn(async move {
            queue2.push(item(1, 1, 1, 10)).await;
        });

        // The second push cannot complete while the queue is full.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        assert!(queue.pop().is_some());
        blocked.await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_progress_signal_fires_on_range_and_push() {
        let queue = ChainQueue::new(1, 4);
        let mut rx = queue.subscribe();

        queue.mark_range_fetched(10, 100);
        rx.changed().await.unwrap();

        queue.push(item(1, 1, 0, 10)).await;
        rx.changed().await.unwrap();
    }
}
