pub mod memory;
pub mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ProfilerConfig, StoreBackend};
use crate::error::StoreError;
use crate::id::RequestId;
use crate::record::ProfileRecord;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Short-lived home of profile records.
///
/// Records are written once under a fresh id and expire after their TTL.
/// Implementations must accept concurrent writers and readers; a record is
/// either fully visible or not at all.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Store `record` under `id` for `ttl`. Writing an id twice is a
    /// [`StoreError::Conflict`].
    async fn put(
        &self,
        id: &RequestId,
        record: &ProfileRecord,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Look up several ids at once. The result lines up with `ids`; unknown
    /// or expired ids are `None`.
    async fn get(&self, ids: &[RequestId]) -> Result<Vec<Option<ProfileRecord>>, StoreError>;
}

/// Build the store the configuration asks for.
pub async fn connect(config: &ProfilerConfig) -> Result<Arc<dyn ProfileStore>, StoreError> {
    Ok(match config.store {
        StoreBackend::Memory => Arc::new(MemoryStore::new(config.max_entries)),
        StoreBackend::Redis => Arc::new(RedisStore::connect(&config.redis_url).await?),
    })
}
