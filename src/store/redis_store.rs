use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::error::StoreError;
use crate::id::RequestId;
use crate::record::ProfileRecord;

use super::ProfileStore;

const KEY_PREFIX: &str = "mini_profiler:profile:";

/// Records shared between servers through Redis, one JSON value per key.
///
/// `SET NX EX` makes every write atomic and write-once, and Redis expires
/// the keys on its own.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect with an auto-reconnecting `ConnectionManager`.
    ///
    /// `ConnectionManager` is cheaply cloneable; every clone shares one
    /// multiplexed connection.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

fn key(id: &RequestId) -> String {
    format!("{KEY_PREFIX}{id}")
}

#[async_trait]
impl ProfileStore for RedisStore {
    async fn put(
        &self,
        id: &RequestId,
        record: &ProfileRecord,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        let mut conn = self.conn.clone();
        let reply: redis::Value = redis::cmd("SET")
            .arg(key(id))
            .arg(json)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        match reply {
            redis::Value::Nil => Err(StoreError::Conflict(id.clone())),
            _ => Ok(()),
        }
    }

    async fn get(&self, ids: &[RequestId]) -> Result<Vec<Option<ProfileRecord>>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(key).collect();
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        Ok(ids
            .iter()
            .zip(values)
            .map(|(id, value)| {
                let json = value?;
                match serde_json::from_str(&json) {
                    Ok(record) => Some(record),
                    Err(err) => {
                        tracing::warn!(%id, ?err, "undecodable profile record, treating as expired");
                        None
                    }
                }
            })
            .collect())
    }
}
