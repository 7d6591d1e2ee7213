//! Thin JSON-RPC client over alloy.
//!
//! Requests are single-shot: the fetcher state machine owns all retry and
//! backoff policy, so a failure here surfaces immediately.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use alloy::network::Ethereum;
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::{Block, BlockId, BlockNumberOrTag, Filter, Log};
use async_trait::async_trait;
use governor::clock::{QuantaClock, QuantaInstant};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Jitter, Quota, RateLimiter};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("invalid RPC URL: {0}")]
    InvalidUrl(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("block {0} not available")]
    NullBlock(u64),
}

pub type StandardRateLimiter =
    RateLimiter<NotKeyed, InMemoryState, QuantaClock, NoOpMiddleware<QuantaInstant>>;

/// What the chain fetchers need from a JSON-RPC endpoint.
#[async_trait]
pub trait LogProvider: Send + Sync + 'static {
    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, RpcError>;
    async fn get_block(&self, number: u64) -> Result<Block, RpcError>;
    async fn get_block_number(&self) -> Result<u64, RpcError>;
}

#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub url: Url,
    pub rate_limit: Option<RateLimitConfig>,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_second: NonZeroU32,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: NonZeroU32::new(10).expect("non-zero"),
            jitter_min_ms: 5,
            jitter_max_ms: 50,
        }
    }
}

impl RpcClientConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            rate_limit: None,
        }
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }
}

pub struct RpcClient {
    provider: RootProvider<Ethereum>,
    config: RpcClientConfig,
    rate_limiter: Option<Arc<StandardRateLimiter>>,
    jitter: Option<Jitter>,
}

impl RpcClient {
    pub fn new(config: RpcClientConfig) -> Result<Self, RpcError> {
        let provider = RootProvider::<Ethereum>::new_http(config.url.clone());

        let (rate_limiter, jitter) = if let Some(ref rate_config) = config.rate_limit {
            let quota = Quota::per_second(rate_config.requests_per_second);
            let limiter = RateLimiter::direct(quota);
            let jitter = Jitter::new(
                Duration::from_millis(rate_config.jitter_min_ms),
                Duration::from_millis(rate_config.jitter_max_ms),
            );
            (Some(Arc::new(limiter)), Some(jitter))
        } else {
            (None, None)
        };

        Ok(Self {
            provider,
            config,
            rate_limiter,
            jitter,
        })
    }

    pub fn from_url(url: &str) -> Result<Self, RpcError> {
        let url = Url::parse(url).map_err(|e| RpcError::InvalidUrl(e.to_string()))?;
        Self::new(RpcClientConfig::new(url))
    }

    pub fn config(&self) -> &RpcClientConfig {
        &self.config
    }

    async fn wait_for_rate_limit(&self) {
        if let (Some(limiter), Some(jitter)) = (&self.rate_limiter, &self.jitter) {
            limiter.until_ready_with_jitter(*jitter).await;
        }
    }
}

#[async_trait]
impl LogProvider for RpcClient {
    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, RpcError> {
        self.wait_for_rate_limit().await;
        self.provider
            .get_logs(filter)
            .await
            .map_err(|e| RpcError::Provider(e.to_string()))
    }

    async fn get_block(&self, number: u64) -> Result<Block, RpcError> {
        self.wait_for_rate_limit().await;
        self.provider
            .get_block(BlockId::Number(BlockNumberOrTag::Number(number)))
            .await
            .map_err(|e| RpcError::Provider(e.to_string()))?
            .ok_or(RpcError::NullBlock(number))
    }

    async fn get_block_number(&self) -> Result<u64, RpcError> {
        self.wait_for_rate_limit().await;
        self.provider
            .get_block_number()
            .await
            .map_err(|e| RpcError::Provider(e.to_string()))
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("config", &self.config)
            .field("has_rate_limiter", &self.rate_limiter.is_some())
            .finish()
    }
}
