mod commit;
mod decoding;
mod fetcher;
mod indexer;
mod pipeline;
mod rpc;
mod storage;
mod store;
mod types;

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use indexer::Indexer;
use pipeline::build_registry;
use rpc::{LogProvider, RpcClient};
use storage::PostgresStorage;
use types::config::indexer::IndexerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "config/config.json".to_string());
    let config = IndexerConfig::load(Path::new(&config_path))?;
    tracing::info!(
        chains = config.chains.len(),
        entities = config.entities.len(),
        "loaded config from {config_path}"
    );

    let database_url = env::var(&config.database_url_env_var).map_err(|_| {
        anyhow::anyhow!(
            "environment variable {} not set",
            config.database_url_env_var
        )
    })?;
    let storage = Arc::new(PostgresStorage::connect(&database_url, &config.entities).await?);

    let mut providers: HashMap<u64, Arc<dyn LogProvider>> = HashMap::new();
    for chain in &config.chains {
        let rpc_url = env::var(&chain.rpc_url_env_var).map_err(|_| {
            anyhow::anyhow!(
                "environment variable {} not set for chain {}",
                chain.rpc_url_env_var,
                chain.name
            )
        })?;
        providers.insert(chain.chain_id, Arc::new(RpcClient::from_url(&rpc_url)?));
        tracing::info!(chain = %chain.name, chain_id = chain.chain_id, "connected to RPC");
    }

    let handlers = build_registry();
    let indexer = Indexer::new(config, providers, storage, handlers)?;

    let shutdown = indexer.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down after the current batch");
            shutdown.shutdown();
        }
    });

    indexer.start().await?;
    tracing::info!("indexer stopped");
    Ok(())
}
