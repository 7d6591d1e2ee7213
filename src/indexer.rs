//! Top-level indexing service.
//!
//! `start()` resumes per-chain positions from the durable checkpoints,
//! re-registers previously discovered dynamic contracts, spawns one fetcher
//! task per chain, and then runs the sequential batch loop: form a globally
//! ordered batch, process it (load phase, handle phase), commit, apply any
//! dynamic contract registrations, repeat. One batch is in flight at a time,
//! so handlers always observe a single-threaded store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinSet;

use crate::commit::{ChainRange, CommitEngine, CommitError};
use crate::decoding::{DecodeError, EventDecoderRegistry};
use crate::fetcher::{AuxQueue, ChainFetcher, ChainManager, ChainQueue, FetchError, ManagerError};
use crate::pipeline::{BatchProcessor, ContractRegistration, HandlerRegistry, ProcessError};
use crate::rpc::LogProvider;
use crate::storage::{Persistence, StorageError};
use crate::store::staged::Store;
use crate::types::config::indexer::IndexerConfig;
use crate::types::event::EventItem;

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("no provider configured for chain {0}")]
    MissingProvider(u64),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("commit failed after {attempts} attempts, batch left unacknowledged: {source}")]
    CommitRetriesExhausted {
        attempts: u32,
        #[source]
        source: CommitError,
    },

    #[error("fetcher for chain {chain_id} stopped unexpectedly")]
    FetcherStopped {
        chain_id: u64,
        #[source]
        source: Option<FetchError>,
    },

    #[error("fetcher task panicked: {0}")]
    FetcherPanicked(String),
}

#[derive(Debug, Default)]
struct Shutdown {
    /// Shared with the fetcher tasks, which check it between windows.
    flag: Arc<AtomicBool>,
    notify: Notify,
}

impl Shutdown {
    fn trigger(&self) {
        self.flag.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    fn requested(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Cooperative stop signal; safe to call from any task. The indexer stops
/// between batches, and in-flight RPCs complete or time out on their own.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<Shutdown>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.trigger();
    }
}

pub struct Indexer {
    config: IndexerConfig,
    providers: HashMap<u64, Arc<dyn LogProvider>>,
    storage: Arc<dyn Persistence>,
    registry: Arc<EventDecoderRegistry>,
    handlers: Arc<HandlerRegistry>,
    shutdown: Arc<Shutdown>,
}

impl Indexer {
    pub fn new(
        config: IndexerConfig,
        providers: HashMap<u64, Arc<dyn LogProvider>>,
        storage: Arc<dyn Persistence>,
        handlers: HandlerRegistry,
    ) -> Result<Self, IndexerError> {
        let registry = Arc::new(EventDecoderRegistry::from_config(&config.chains)?);
        Ok(Self {
            config,
            providers,
            storage,
            registry,
            handlers: Arc::new(handlers),
            shutdown: Arc::new(Shutdown::default()),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    pub async fn start(&self) -> Result<(), IndexerError> {
        // Contracts discovered by earlier runs become fetch targets again.
        for row in self.storage.dynamic_contracts().await? {
            self.registry
                .add_contract(row.chain_id, row.contract_address, &row.contract_type)?;
        }

        let aux = Arc::new(AuxQueue::default());
        let mut commit_engine = CommitEngine::new(self.storage.clone());
        let mut fetchers = Vec::with_capacity(self.config.chains.len());

        for chain in &self.config.chains {
            let provider = self
                .providers
                .get(&chain.chain_id)
                .cloned()
                .ok_or(IndexerError::MissingProvider(chain.chain_id))?;

            let checkpoint = self.storage.latest_processed_block(chain.chain_id).await?;
            if let Some(block) = checkpoint {
                commit_engine.resume_checkpoint(chain.chain_id, block);
            }
            let start_block = checkpoint
                .map(|block| block + 1)
                .unwrap_or(chain.start_block)
                .max(chain.start_block);
            tracing::info!(
                chain_id = chain.chain_id,
                start_block,
                resumed = checkpoint.is_some(),
                "chain scheduled"
            );

            let queue = Arc::new(ChainQueue::new(
                chain.chain_id,
                self.config.sync.max_queue_size,
            ));
            fetchers.push(Arc::new(ChainFetcher::new(
                chain.chain_id,
                start_block,
                chain.max_block_interval,
                provider,
                self.registry.clone(),
                queue,
                aux.clone(),
                self.config.sync.clone(),
                self.shutdown_flag(),
            )));
        }

        let mut tasks: JoinSet<(u64, Result<(), FetchError>)> = JoinSet::new();
        for fetcher in &fetchers {
            let fetcher = fetcher.clone();
            tasks.spawn(async move {
                let chain_id = fetcher.chain_id();
                (chain_id, fetcher.run().await)
            });
        }

        let mut manager = ChainManager::new(fetchers, aux);
        let processor = BatchProcessor::new(self.handlers.clone(), self.storage.clone());
        let mut store = Store::new();

        let result = self
            .run_loop(
                &mut manager,
                &processor,
                &mut commit_engine,
                &mut store,
                &mut tasks,
            )
            .await;

        // Stop the fetchers on the way out, successful or not.
        self.shutdown.trigger();
        tasks.shutdown().await;
        result
    }

    async fn run_loop(
        &self,
        manager: &mut ChainManager,
        processor: &BatchProcessor,
        commit_engine: &mut CommitEngine,
        store: &mut Store,
        tasks: &mut JoinSet<(u64, Result<(), FetchError>)>,
    ) -> Result<(), IndexerError> {
        loop {
            if self.shutdown.requested() {
                tracing::info!("shutdown requested, stopping between batches");
                return Ok(());
            }

            let batch = tokio::select! {
                batch = manager.make_batch(self.config.sync.batch_min, self.config.sync.batch_max) => batch,
                _ = self.shutdown.notify.notified() => return Ok(()),
                Some(joined) = tasks.join_next() => {
                    return match joined {
                        Ok((chain_id, Err(source))) => Err(IndexerError::FetcherStopped {
                            chain_id,
                            source: Some(source),
                        }),
                        Ok((chain_id, Ok(()))) if !self.shutdown.requested() => {
                            Err(IndexerError::FetcherStopped { chain_id, source: None })
                        }
                        Ok(_) => Ok(()),
                        Err(join_err) => Err(IndexerError::FetcherPanicked(join_err.to_string())),
                    };
                }
            };
            if batch.is_empty() {
                continue;
            }

            tracing::debug!(items = batch.len(), "processing batch");
            let registrations = self
                .process_and_commit(&batch, store, processor, commit_engine)
                .await?;

            for registration in registrations {
                manager
                    .register_dynamic_contract(
                        registration.chain_id,
                        registration.contract_address,
                        &registration.contract_type,
                        registration.registered_at_block,
                    )
                    .await?;
            }
        }
    }

    /// Load, handle, commit. A retryable commit failure rolls back and the
    /// batch is reprocessed from the load phase, a bounded number of times
    /// with exponential backoff. The checkpoint only moves on success.
    async fn process_and_commit(
        &self,
        batch: &[EventItem],
        store: &mut Store,
        processor: &BatchProcessor,
        commit_engine: &mut CommitEngine,
    ) -> Result<Vec<ContractRegistration>, IndexerError> {
        let ranges = chain_ranges(batch);
        let max_retries = self.config.sync.commit_max_retries;
        let mut failures = 0u32;

        loop {
            store.reset();
            let registrations = processor.process(batch, store).await?;

            match commit_engine.commit(store, &ranges).await {
                Ok(()) => {
                    store.reset();
                    return Ok(registrations);
                }
                Err(err) if err.is_retryable() => {
                    failures += 1;
                    if failures > max_retries {
                        return Err(IndexerError::CommitRetriesExhausted {
                            attempts: failures,
                            source: err,
                        });
                    }
                    let delay = commit_backoff_delay(self.config.sync.commit_backoff_millis, failures);
                    tracing::warn!(
                        attempt = failures,
                        max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "commit failed, retrying batch from the load phase"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.flag.clone()
    }
}

fn commit_backoff_delay(base_millis: u64, failure: u32) -> Duration {
    let shift = (failure.saturating_sub(1)).min(10);
    Duration::from_millis(base_millis.saturating_mul(1u64 << shift))
}

/// Per-chain [from, to] block ranges covered by a batch, ascending by chain.
fn chain_ranges(batch: &[EventItem]) -> Vec<ChainRange> {
    let mut bounds: BTreeMap<u64, (u64, u64)> = BTreeMap::new();
    for item in batch {
        bounds
            .entry(item.chain_id)
            .and_modify(|(from, to)| {
                *from = (*from).min(item.block_number);
                *to = (*to).max(item.block_number);
            })
            .or_insert((item.block_number, item.block_number));
    }
    bounds
        .into_iter()
        .map(|(chain_id, (from_block, to_block))| ChainRange {
            chain_id,
            from_block,
            to_block,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;

    use crate::decoding::types::DecodedValue;
    use crate::fetcher::testing::{ping_chain_config, ping_log, MockProvider};
    use crate::pipeline::{EventHandler, EventTrigger, HandlerError, HandlerContext, LoaderContext};
    use crate::storage::{CommitBatch, MemoryStorage};
    use crate::store::entity::{EntityRow, FieldValue};
    use crate::types::config::sync::SyncConfig;

    use super::*;

    /// Counts pings per id in a "Counter" entity.
    struct PingHandler;

    #[async_trait]
    impl EventHandler for PingHandler {
        fn triggers(&self) -> Vec<EventTrigger> {
            vec![EventTrigger::new("Ping", "Ping")]
        }

        fn load(&self, event: &EventItem, loader: &mut LoaderContext) {
            if let Some(id) = event.event.param("id").and_then(DecodedValue::as_u256) {
                loader.load("Counter", &id.to_string());
            }
        }

        async fn handle(
            &self,
            event: &EventItem,
            ctx: &mut HandlerContext<'_>,
        ) -> Result<(), HandlerError> {
            let id = event
                .event
                .param("id")
                .and_then(DecodedValue::as_u256)
                .ok_or_else(|| HandlerError::missing_param("Ping", "id"))?
                .to_string();
            match ctx
                .get("Counter", &id)
                .and_then(|row| row.field("count"))
                .and_then(FieldValue::as_i64)
            {
                Some(count) => ctx.update(
                    "Counter",
                    EntityRow::new(id.as_str()).with_field("count", FieldValue::Int(count + 1)),
                ),
                None => ctx.insert(
                    "Counter",
                    EntityRow::new(id.as_str()).with_field("count", FieldValue::Int(1)),
                ),
            }
            Ok(())
        }
    }

    fn test_config() -> IndexerConfig {
        IndexerConfig {
            chains: vec![ping_chain_config(1)],
            entities: Vec::new(),
            sync: SyncConfig {
                head_poll_millis: 10,
                ..SyncConfig::default()
            },
            database_url_env_var: "DATABASE_URL".to_string(),
        }
    }

    fn handlers() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register(PingHandler);
        registry
    }

    fn providers(provider: Arc<MockProvider>) -> HashMap<u64, Arc<dyn LogProvider>> {
        let mut map: HashMap<u64, Arc<dyn LogProvider>> = HashMap::new();
        map.insert(1, provider);
        map
    }

    /// Runs the indexer until the chain-1 checkpoint reaches `target` and
    /// `raw_events` raw rows are durable, then shuts it down.
    async fn run_until_checkpoint(
        storage: &Arc<MemoryStorage>,
        provider: Arc<MockProvider>,
        target: u64,
        raw_events: usize,
    ) -> Result<(), IndexerError> {
        let indexer = Arc::new(
            Indexer::new(
                test_config(),
                providers(provider),
                storage.clone(),
                handlers(),
            )
            .unwrap(),
        );
        let handle = indexer.shutdown_handle();
        let runner = indexer.clone();
        let task = tokio::spawn(async move { runner.start().await });

        while storage.checkpoint(1) < Some(target) || storage.raw_event_count() < raw_events {
            if task.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        handle.shutdown();
        task.await.expect("indexer task panicked")
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_ping_counting() {
        let provider = Arc::new(MockProvider::new(10));
        provider.set_block_timestamps(0..=10, |n| 100 + n);
        provider.add_log(ping_log(1, 0, 7));
        provider.add_log(ping_log(2, 0, 7));
        provider.add_log(ping_log(2, 1, 9));

        let storage = Arc::new(MemoryStorage::new());
        run_until_checkpoint(&storage, provider, 2, 3).await.unwrap();

        let counters = storage.entity_table("Counter");
        assert_eq!(
            counters.get("7").unwrap().field("count"),
            Some(&FieldValue::Int(2))
        );
        assert_eq!(
            counters.get("9").unwrap().field("count"),
            Some(&FieldValue::Int(1))
        );
        assert_eq!(storage.raw_event_count(), 3);
        assert_eq!(storage.checkpoint(1), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reprocessing_is_deterministic() {
        fn make_provider() -> Arc<MockProvider> {
            let provider = Arc::new(MockProvider::new(20));
            provider.set_block_timestamps(0..=20, |n| 100 + n);
            for block in [1, 3, 7, 12] {
                provider.add_log(ping_log(block, 0, block));
            }
            provider.add_log(ping_log(3, 1, 99));
            provider
        }

        async fn run_fresh() -> BTreeMap<String, BTreeMap<String, EntityRow>> {
            let storage = Arc::new(MemoryStorage::new());
            run_until_checkpoint(&storage, make_provider(), 12, 5)
                .await
                .unwrap();
            storage.all_entities()
        }

        let first = run_fresh().await;
        let second = run_fresh().await;
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_skips_processed_blocks() {
        let provider = Arc::new(MockProvider::new(10));
        provider.set_block_timestamps(0..=10, |n| 100 + n);
        provider.add_log(ping_log(3, 0, 3));
        provider.add_log(ping_log(8, 0, 8));

        let storage = Arc::new(MemoryStorage::new());
        storage
            .commit(CommitBatch {
                checkpoints: vec![(1, 5)],
                ..CommitBatch::default()
            })
            .await
            .unwrap();

        run_until_checkpoint(&storage, provider.clone(), 8, 1)
            .await
            .unwrap();

        // Fetching resumed after the checkpoint, so block 3 never reappears.
        assert_eq!(provider.get_logs_calls()[0].0, 6);
        let counters = storage.entity_table("Counter");
        assert!(!counters.contains_key("3"));
        assert_eq!(
            counters.get("8").unwrap().field("count"),
            Some(&FieldValue::Int(1))
        );
        assert_eq!(storage.checkpoint(1), Some(8));
    }

    /// Fails every commit with a retryable storage error.
    struct FailingStorage {
        inner: MemoryStorage,
    }

    #[async_trait]
    impl Persistence for FailingStorage {
        async fn batch_read(
            &self,
            entity_type: &str,
            ids: &[String],
        ) -> Result<Vec<EntityRow>, StorageError> {
            self.inner.batch_read(entity_type, ids).await
        }

        async fn commit(&self, _batch: CommitBatch) -> Result<(), StorageError> {
            Err(StorageError::Migration("injected commit failure".to_string()))
        }

        async fn latest_processed_block(&self, chain_id: u64) -> Result<Option<u64>, StorageError> {
            self.inner.latest_processed_block(chain_id).await
        }

        async fn dynamic_contracts(
            &self,
        ) -> Result<Vec<crate::types::event::DynamicContractRow>, StorageError> {
            self.inner.dynamic_contracts().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_retries_exhaust_and_surface() {
        let provider = Arc::new(MockProvider::new(5));
        provider.set_block_timestamps(0..=5, |n| 100 + n);
        provider.add_log(ping_log(1, 0, 1));

        let storage = Arc::new(FailingStorage {
            inner: MemoryStorage::new(),
        });
        let indexer = Indexer::new(
            test_config(),
            providers(provider),
            storage,
            handlers(),
        )
        .unwrap();

        let err = indexer.start().await.unwrap_err();
        match err {
            IndexerError::CommitRetriesExhausted { attempts, .. } => {
                assert_eq!(attempts, SyncConfig::default().commit_max_retries + 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_chain_ranges_span_min_to_max_per_chain() {
        use crate::fetcher::testing::bare_item;
        let batch = vec![
            bare_item(1, 10, 0, 100),
            bare_item(2, 5, 0, 101),
            bare_item(1, 3, 0, 102),
            bare_item(1, 12, 0, 103),
        ];
        assert_eq!(
            chain_ranges(&batch),
            vec![
                ChainRange {
                    chain_id: 1,
                    from_block: 3,
                    to_block: 12
                },
                ChainRange {
                    chain_id: 2,
                    from_block: 5,
                    to_block: 5
                },
            ]
        );
    }

    #[test]
    fn test_commit_backoff_doubles() {
        assert_eq!(commit_backoff_delay(500, 1), Duration::from_millis(500));
        assert_eq!(commit_backoff_delay(500, 2), Duration::from_millis(1000));
        assert_eq!(commit_backoff_delay(500, 3), Duration::from_millis(2000));
    }
}
