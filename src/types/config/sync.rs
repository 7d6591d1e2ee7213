use serde::Deserialize;

/// Fetch, batching, and commit tuning. Every knob has a production default;
/// configs only name what they change.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Shrink factor applied to the block interval after an RPC failure.
    #[serde(default = "default_backoff_multiplicative")]
    pub backoff_multiplicative: f64,
    /// Blocks added back to the interval after each successful window.
    #[serde(default = "default_acceleration_additive")]
    pub acceleration_additive: u64,
    /// Delay before re-querying after an RPC failure.
    #[serde(default = "default_backoff_millis")]
    pub backoff_millis: u64,
    /// Budget for a single `getLogs` request.
    #[serde(default = "default_query_timeout_millis")]
    pub query_timeout_millis: u64,
    /// Poll cadence while waiting for new blocks at the chain head.
    #[serde(default = "default_head_poll_millis")]
    pub head_poll_millis: u64,
    /// Per-chain queue capacity; fetchers block when it fills.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Batch formation: block until this many items are available.
    #[serde(default = "default_batch_min")]
    pub batch_min: usize,
    /// Batch formation: then drain opportunistically up to this many.
    #[serde(default = "default_batch_max")]
    pub batch_max: usize,
    /// How many times a failed commit is retried from the load phase.
    #[serde(default = "default_commit_max_retries")]
    pub commit_max_retries: u32,
    /// Base delay of the commit retry backoff; doubles per attempt.
    #[serde(default = "default_commit_backoff_millis")]
    pub commit_backoff_millis: u64,
}

fn default_backoff_multiplicative() -> f64 {
    0.8
}

fn default_acceleration_additive() -> u64 {
    500
}

fn default_backoff_millis() -> u64 {
    5000
}

fn default_query_timeout_millis() -> u64 {
    20_000
}

fn default_head_poll_millis() -> u64 {
    1000
}

fn default_max_queue_size() -> usize {
    100_000
}

fn default_batch_min() -> usize {
    1
}

fn default_batch_max() -> usize {
    5000
}

fn default_commit_max_retries() -> u32 {
    5
}

fn default_commit_backoff_millis() -> u64 {
    500
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backoff_multiplicative: default_backoff_multiplicative(),
            acceleration_additive: default_acceleration_additive(),
            backoff_millis: default_backoff_millis(),
            query_timeout_millis: default_query_timeout_millis(),
            head_poll_millis: default_head_poll_millis(),
            max_queue_size: default_max_queue_size(),
            batch_min: default_batch_min(),
            batch_max: default_batch_max(),
            commit_max_retries: default_commit_max_retries(),
            commit_backoff_millis: default_commit_backoff_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let sync: SyncConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(sync.backoff_multiplicative, 0.8);
        assert_eq!(sync.backoff_millis, 5000);
        assert_eq!(sync.query_timeout_millis, 20_000);
        assert_eq!(sync.batch_min, 1);
        assert_eq!(sync.commit_max_retries, 5);
    }

    #[test]
    fn test_overrides() {
        let sync: SyncConfig =
            serde_json::from_str(r#"{"batch_max": 100, "max_queue_size": 10}"#).unwrap();
        assert_eq!(sync.batch_max, 100);
        assert_eq!(sync.max_queue_size, 10);
        assert_eq!(sync.batch_min, 1);
    }
}
