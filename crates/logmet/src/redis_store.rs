// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Redis-backed bucket store for multi-node deployments.
//!
//! Each bucket lives under keys derived from its encoded id: a hash holds
//! the running sum (updated with `HINCRBYFLOAT`) and a list holds the
//! values. A per-(partition, ready-second) index set drives the scan, and a
//! short-TTL `SET NX` lock guarantees at most one scanner per partition and
//! second across nodes. Every key expires after twice the bucket's
//! resolution so orphaned entries clean themselves up.

use crate::bucket::{Bucket, BucketId};
use crate::errors::StoreError;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tracing::warn;

const SCAN_LOCK_TTL_MS: u64 = 5_000;
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    partitions: usize,
}

impl RedisStore {
    /// Connect with an auto-reconnecting multiplexed connection. Clones of
    /// the manager share the underlying TCP connection.
    pub async fn connect(url: &str, partitions: usize) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            partitions: partitions.max(1),
        })
    }

    pub fn max_partitions(&self) -> usize {
        self.partitions
    }

    fn partition(&self, key: &str) -> usize {
        partition_of(key, self.partitions)
    }

    pub async fn put(&self, b: &Bucket) -> Result<(), StoreError> {
        let key = b.id.encode();
        let partition = self.partition(&key);
        let index = format!("locks.{}.{}", partition, b.id.ready_at.timestamp());
        let hash_key = format!("bucket.{key}");
        let vals_key = format!("vals.{key}");
        let ttl = (2 * b.id.resolution.as_secs()).max(1);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("SADD").arg(&index).arg(&key).ignore();
        pipe.cmd("EXPIRE").arg(&index).arg(ttl).ignore();
        pipe.cmd("HINCRBYFLOAT")
            .arg(&hash_key)
            .arg("sum")
            .arg(b.sum)
            .ignore();
        pipe.cmd("EXPIRE").arg(&hash_key).arg(ttl).ignore();
        if !b.vals.is_empty() {
            pipe.cmd("RPUSH").arg(&vals_key).arg(&b.vals).ignore();
            pipe.cmd("EXPIRE").arg(&vals_key).arg(ttl).ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Atomic read-and-clear. Of any number of concurrent getters for the
    /// same id, exactly one sees data; the rest see NotFound.
    pub async fn get(&self, b: &mut Bucket) -> Result<(), StoreError> {
        let key = b.id.encode();
        let hash_key = format!("bucket.{key}");
        let vals_key = format!("vals.{key}");

        let mut conn = self.conn.clone();
        let (sum, vals, _deleted): (Option<f64>, Vec<f64>, i64) = redis::pipe()
            .atomic()
            .cmd("HGET")
            .arg(&hash_key)
            .arg("sum")
            .cmd("LRANGE")
            .arg(&vals_key)
            .arg(0)
            .arg(-1)
            .cmd("DEL")
            .arg(&hash_key)
            .arg(&vals_key)
            .query_async(&mut conn)
            .await?;

        if sum.is_none() && vals.is_empty() {
            return Err(StoreError::NotFound);
        }
        b.sum = sum.unwrap_or_else(|| vals.iter().sum());
        b.vals = vals;
        Ok(())
    }

    /// Drain the index sets for the cutoff second. The advisory lock bounds
    /// duplicate delivery to one scanner per (partition, second); index
    /// sets for seconds no scanner visited age out via their TTL.
    pub async fn scan(&self, cutoff: DateTime<Utc>) -> Result<Vec<Bucket>, StoreError> {
        let t = cutoff.timestamp();
        let mut out = Vec::new();
        let mut conn = self.conn.clone();
        for partition in 0..self.partitions {
            let lock = format!("lock.scan.{partition}.{t}");
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&lock)
                .arg(1)
                .arg("NX")
                .arg("PX")
                .arg(SCAN_LOCK_TTL_MS)
                .query_async(&mut conn)
                .await?;
            if acquired.is_none() {
                continue;
            }

            let index = format!("locks.{partition}.{t}");
            let (members, _deleted): (Vec<String>, i64) = redis::pipe()
                .atomic()
                .cmd("SMEMBERS")
                .arg(&index)
                .cmd("DEL")
                .arg(&index)
                .query_async(&mut conn)
                .await?;

            for member in members {
                match BucketId::decode(&member) {
                    Ok(id) => out.push(Bucket::new(id)),
                    Err(e) => warn!(error = %e, "skipping undecodable store key"),
                }
            }
        }
        Ok(out)
    }

    /// The Redis server clock, so every node agrees on bucket readiness.
    pub async fn now(&self) -> Result<DateTime<Utc>, StoreError> {
        let mut conn = self.conn.clone();
        let (secs, micros): (i64, i64) = redis::cmd("TIME").query_async(&mut conn).await?;
        Ok(DateTime::from_timestamp(secs, (micros as u32).saturating_mul(1_000))
            .unwrap_or_else(Utc::now))
    }

    pub async fn health(&self) -> bool {
        let mut conn = self.conn.clone();
        let ping = async {
            let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<String, redis::RedisError>(pong)
        };
        matches!(
            tokio::time::timeout(HEALTH_TIMEOUT, ping).await,
            Ok(Ok(ref pong)) if pong == "PONG"
        )
    }
}

fn partition_of(key: &str, partitions: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketKind;
    use chrono::Utc;
    use ustr::ustr;

    #[test]
    fn test_partition_is_stable_and_bounded() {
        let id = BucketId::new(
            "enc".to_string(),
            ustr("db.latency"),
            ustr("web.1"),
            ustr("ms"),
            BucketKind::Measurement,
            Duration::from_secs(60),
            Utc::now(),
        );
        let key = id.encode();
        assert_eq!(partition_of(&key, 8), partition_of(&key, 8));
        for partitions in [1, 2, 8, 128] {
            assert!(partition_of(&key, partitions) < partitions);
        }
    }

    #[test]
    fn test_distinct_keys_spread_over_partitions() {
        let hits: std::collections::HashSet<usize> = (0..64)
            .map(|i| partition_of(&format!("bucket-{i}"), 8))
            .collect();
        assert!(hits.len() > 1);
    }
}
