// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Coordinates bucket transfer between the receivers (front-end) and the
//! readers & outlets (back-end).
//!
//! Two backends satisfy the same contract: merge-on-write `put`,
//! read-and-clear `get`, and a `scan` that yields the ids ready at or
//! before a cutoff. The variant is chosen once at startup.

use crate::bucket::{Bucket, BucketId};
use crate::errors::StoreError;
use crate::redis_store::RedisStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

#[derive(Clone)]
pub enum Store {
    Mem(MemStore),
    Redis(RedisStore),
}

impl Store {
    pub fn in_memory() -> Self {
        Store::Mem(MemStore::default())
    }

    pub async fn shared(url: &str, partitions: usize) -> Result<Self, StoreError> {
        Ok(Store::Redis(RedisStore::connect(url, partitions).await?))
    }

    /// Merge-on-write: an existing bucket with the same id absorbs `b`.
    pub async fn put(&self, b: Bucket) -> Result<(), StoreError> {
        match self {
            Store::Mem(s) => s.put(b),
            Store::Redis(s) => s.put(&b).await,
        }
    }

    /// Populate `b` from the stored entry and clear it. Exactly one of any
    /// set of concurrent getters for the same id sees the data.
    pub async fn get(&self, b: &mut Bucket) -> Result<(), StoreError> {
        match self {
            Store::Mem(s) => s.get(b),
            Store::Redis(s) => s.get(b).await,
        }
    }

    /// Every stored id with `ready_at <= cutoff` not claimed by another
    /// scanner this cycle. Shared-backend buckets come back as stubs; the
    /// caller is expected to `get` next.
    pub async fn scan(&self, cutoff: DateTime<Utc>) -> Result<Vec<Bucket>, StoreError> {
        match self {
            Store::Mem(s) => Ok(s.scan(cutoff)),
            Store::Redis(s) => s.scan(cutoff).await,
        }
    }

    /// The backend's authoritative clock. Outlets use this rather than the
    /// local clock so that nodes with drifting clocks agree on readiness.
    pub async fn now(&self) -> DateTime<Utc> {
        match self {
            Store::Mem(_) => Utc::now(),
            Store::Redis(s) => match s.now().await {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "falling back to local clock");
                    Utc::now()
                }
            },
        }
    }

    pub fn max_partitions(&self) -> usize {
        match self {
            Store::Mem(_) => 1,
            Store::Redis(s) => s.max_partitions(),
        }
    }

    pub async fn health(&self) -> bool {
        match self {
            Store::Mem(_) => true,
            Store::Redis(s) => s.health().await,
        }
    }
}

#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<HashMap<BucketId, Bucket>>>,
}

#[allow(clippy::expect_used)]
impl MemStore {
    fn put(&self, b: Bucket) -> Result<(), StoreError> {
        let mut m = self.inner.lock().expect("lock poisoned");
        match m.get_mut(&b.id) {
            Some(existing) => existing.merge(b),
            None => {
                m.insert(b.id.clone(), b);
            }
        }
        Ok(())
    }

    fn get(&self, b: &mut Bucket) -> Result<(), StoreError> {
        let mut m = self.inner.lock().expect("lock poisoned");
        match m.remove(&b.id) {
            Some(stored) => {
                b.vals = stored.vals;
                b.sum = stored.sum;
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    fn scan(&self, cutoff: DateTime<Utc>) -> Vec<Bucket> {
        let mut m = self.inner.lock().expect("lock poisoned");
        let ready: Vec<BucketId> = m
            .keys()
            .filter(|id| id.ready_at <= cutoff)
            .cloned()
            .collect();
        ready.into_iter().filter_map(|id| m.remove(&id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketKind;
    use std::time::Duration;
    use ustr::ustr;

    fn bucket(name: &str, kind: BucketKind, epoch: i64, val: f64) -> Bucket {
        let id = BucketId::new(
            "enc".to_string(),
            ustr(name),
            ustr(""),
            ustr(""),
            kind,
            Duration::from_secs(60),
            DateTime::from_timestamp(epoch, 0).expect("valid timestamp"),
        );
        Bucket::single(id, val)
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let store = Store::in_memory();
        let b = bucket("db.latency", BucketKind::Measurement, 1_364_414_520, 20.0);
        store.put(b.clone()).await.expect("put");

        let mut fetched = Bucket::new(b.id.clone());
        store.get(&mut fetched).await.expect("get");
        assert_eq!(fetched.vals, b.vals);
        assert_eq!(fetched.sum, b.sum);

        // Read-and-clear: a second getter comes up empty.
        let mut again = Bucket::new(b.id.clone());
        assert!(matches!(
            store.get(&mut again).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_put_merges_same_id() {
        let store = Store::in_memory();
        store
            .put(bucket("api.reqs", BucketKind::Counter, 1_364_414_520, 1.0))
            .await
            .expect("put");
        store
            .put(bucket("api.reqs", BucketKind::Counter, 1_364_414_520, 4.0))
            .await
            .expect("put");

        let cutoff = DateTime::from_timestamp(1_364_414_580, 0).expect("valid timestamp");
        let scanned = store.scan(cutoff).await.expect("scan");
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].sum, 5.0);
        assert_eq!(scanned[0].count(), 2);
    }

    #[tokio::test]
    async fn test_scan_honors_cutoff() {
        let store = Store::in_memory();
        store
            .put(bucket("early", BucketKind::Counter, 1_364_414_520, 1.0))
            .await
            .expect("put");
        store
            .put(bucket("late", BucketKind::Counter, 1_364_418_000, 1.0))
            .await
            .expect("put");

        // ready_at of "early" is 1_364_414_580.
        let cutoff = DateTime::from_timestamp(1_364_414_580, 0).expect("valid timestamp");
        let scanned = store.scan(cutoff).await.expect("scan");
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].id.name.as_str(), "early");

        // A later scan picks up the remainder; drained buckets stay gone.
        let cutoff = DateTime::from_timestamp(1_364_418_060, 0).expect("valid timestamp");
        let scanned = store.scan(cutoff).await.expect("scan");
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].id.name.as_str(), "late");
        assert!(store.scan(cutoff).await.expect("scan").is_empty());
    }

    #[tokio::test]
    async fn test_mem_store_basics() {
        let store = Store::in_memory();
        assert_eq!(store.max_partitions(), 1);
        assert!(store.health().await);
        let drift = (store.now().await - Utc::now()).num_seconds().abs();
        assert!(drift <= 1);
    }
}
