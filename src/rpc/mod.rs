mod client;

pub use client::{LogProvider, RateLimitConfig, RpcClient, RpcClientConfig, RpcError};
