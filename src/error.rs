use thiserror::Error;

use crate::id::RequestId;

/// Failures of a [`ProfileStore`](crate::store::ProfileStore) backend.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("record encoding: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("a record already exists for {0}")]
    Conflict(RequestId),
}

/// Failures of a whole query call. Per-id misses are not errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueryError {
    #[error("profile store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("profile store did not answer within {0:?}")]
    Timeout(std::time::Duration),
}

/// A CPU capture facility failed. The record is still stored without it.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CaptureError {
    #[error("sampler: {0}")]
    Sampler(String),
    #[error("call tracer: {0}")]
    Tracer(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
