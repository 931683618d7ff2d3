use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::id::RequestId;
use crate::record::ProfileRecord;

use super::ProfileStore;

struct Entry {
    record: Arc<ProfileRecord>,
    expires_at: Instant,
}

struct Inner {
    entries: HashMap<RequestId, Entry>,
    /// The same entries, soonest expiry first.
    by_expiry: BTreeSet<(Instant, RequestId)>,
}

/// In-process store for a single server.
///
/// Expiry follows the tokio clock. When full, the entry closest to expiry
/// makes room for the new one.
pub struct MemoryStore {
    capacity: usize,
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                by_expiry: BTreeSet::new(),
            }),
        }
    }

    /// Live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .read()
            .entries
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    /// Drop expired entries; only touches the ones it drops.
    fn sweep(&mut self, now: Instant) {
        while self.by_expiry.first().is_some_and(|(at, _)| *at <= now) {
            self.evict_soonest();
        }
    }

    fn evict_soonest(&mut self) -> bool {
        match self.by_expiry.pop_first() {
            Some((_, id)) => {
                self.entries.remove(&id);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn put(
        &self,
        id: &RequestId,
        record: &ProfileRecord,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        let record = Arc::new(record.clone());
        let mut inner = self.inner.write();

        if let Some(existing) = inner.entries.get(id) {
            if existing.expires_at > now {
                return Err(StoreError::Conflict(id.clone()));
            }
        }

        inner.sweep(now);
        while inner.entries.len() >= self.capacity && inner.evict_soonest() {}

        let expires_at = now + ttl;
        inner.by_expiry.insert((expires_at, id.clone()));
        inner.entries.insert(id.clone(), Entry { record, expires_at });
        Ok(())
    }

    async fn get(&self, ids: &[RequestId]) -> Result<Vec<Option<ProfileRecord>>, StoreError> {
        let now = Instant::now();
        let inner = self.inner.read();
        Ok(ids
            .iter()
            .map(|id| {
                inner
                    .entries
                    .get(id)
                    .filter(|e| e.expires_at > now)
                    .map(|e| ProfileRecord::clone(&e.record))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use crate::record::fixtures::record;

    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn put_then_get_is_repeatable() {
        let store = MemoryStore::new(8);
        let id = RequestId::generate();
        store.put(&id, &record(&id), TTL).await.unwrap();

        let first = store.get(std::slice::from_ref(&id)).await.unwrap();
        let second = store.get(std::slice::from_ref(&id)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].as_ref().map(|r| &r.id), Some(&id));
    }

    #[tokio::test]
    async fn second_write_to_same_id_conflicts() {
        let store = MemoryStore::new(8);
        let id = RequestId::generate();
        store.put(&id, &record(&id), TTL).await.unwrap();
        let mut changed = record(&id);
        changed.total_ms = 1.0;
        let err = store.put(&id, &changed, TTL).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        let stored = store.get(std::slice::from_ref(&id)).await.unwrap();
        assert_eq!(stored[0].as_ref().unwrap().total_ms, 12.5);
    }

    #[tokio::test]
    async fn partial_results_line_up_with_input() {
        let store = MemoryStore::new(8);
        let present = RequestId::generate();
        let absent = RequestId::generate();
        store.put(&present, &record(&present), TTL).await.unwrap();
        let got = store
            .get(&[absent.clone(), present.clone(), absent])
            .await
            .unwrap();
        assert!(got[0].is_none());
        assert!(got[1].is_some());
        assert!(got[2].is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = MemoryStore::new(8);
        let id = RequestId::generate();
        store.put(&id, &record(&id), Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.get(std::slice::from_ref(&id)).await.unwrap()[0].is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get(std::slice::from_ref(&id)).await.unwrap()[0].is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn full_store_evicts_soonest_expiry() {
        let store = MemoryStore::new(2);
        let short = RequestId::generate();
        let long = RequestId::generate();
        let newest = RequestId::generate();
        store.put(&short, &record(&short), Duration::from_secs(5)).await.unwrap();
        store.put(&long, &record(&long), Duration::from_secs(50)).await.unwrap();
        store.put(&newest, &record(&newest), Duration::from_secs(50)).await.unwrap();

        let got = store.get(&[short, long, newest]).await.unwrap();
        assert!(got[0].is_none());
        assert!(got[1].is_some());
        assert!(got[2].is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_make_room_before_live_ones_are_evicted() {
        let store = MemoryStore::new(2);
        let (a, b) = (RequestId::generate(), RequestId::generate());
        store.put(&a, &record(&a), Duration::from_secs(5)).await.unwrap();
        store.put(&b, &record(&b), Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        let (c, d) = (RequestId::generate(), RequestId::generate());
        store.put(&c, &record(&c), TTL).await.unwrap();
        store.put(&d, &record(&d), TTL).await.unwrap();
        let got = store.get(&[c, d]).await.unwrap();
        assert!(got.iter().all(Option::is_some));

        let inner = store.inner.read();
        assert_eq!(inner.entries.len(), 2);
        assert_eq!(inner.by_expiry.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rewriting_an_expired_id_keeps_one_index_entry() {
        let store = MemoryStore::new(8);
        let id = RequestId::generate();
        store.put(&id, &record(&id), Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        store.put(&id, &record(&id), TTL).await.unwrap();

        assert!(store.get(std::slice::from_ref(&id)).await.unwrap()[0].is_some());
        assert_eq!(store.inner.read().by_expiry.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_do_not_interfere() {
        let store = Arc::new(MemoryStore::new(1_000));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..20 {
                    let id = RequestId::generate();
                    store.put(&id, &record(&id), TTL).await.unwrap();
                    ids.push(id);
                }
                ids
            }));
        }
        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        let got = store.get(&all).await.unwrap();
        assert_eq!(got.len(), 320);
        for (id, rec) in all.iter().zip(&got) {
            assert_eq!(&rec.as_ref().unwrap().id, id);
        }
    }
}
