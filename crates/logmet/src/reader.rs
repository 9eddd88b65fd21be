// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scans the store on an interval and hands ready buckets to an outlet.

use crate::bucket::Bucket;
use crate::config::Config;
use crate::errors::StoreError;
use crate::store::Store;
use crate::telemetry::Telemetry;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

pub struct Reader {
    store: Store,
    scan_interval: Duration,
    concurrency: usize,
    buffer_size: usize,
    telemetry: Telemetry,
}

impl Reader {
    pub fn new(cfg: &Config, store: Store, telemetry: Telemetry) -> Self {
        Self {
            store,
            scan_interval: cfg.outlet_interval,
            concurrency: cfg.concurrency,
            buffer_size: cfg.buffer_size,
            telemetry,
        }
    }

    /// Start scanning. Scanned stubs queue on a bounded inbox (a full inbox
    /// blocks the scanner, which is the backpressure signal); a worker pool
    /// fetches each bucket's data and forwards it to `outbox`.
    pub fn start(self, outbox: mpsc::Sender<Bucket>) {
        let (inbox_tx, inbox_rx) = mpsc::channel::<Bucket>(self.buffer_size);
        let inbox_rx = Arc::new(Mutex::new(inbox_rx));

        for _ in 0..self.concurrency {
            let inbox_rx = Arc::clone(&inbox_rx);
            let outbox = outbox.clone();
            let store = self.store.clone();
            let telemetry = self.telemetry.clone();
            tokio::spawn(async move {
                loop {
                    let bucket = { inbox_rx.lock().await.recv().await };
                    let Some(mut b) = bucket else { break };
                    let start = Instant::now();
                    match store.get(&mut b).await {
                        Ok(()) => {}
                        // The memory backend's scan already carries the
                        // data; a missed get is not an error here.
                        Err(StoreError::NotFound) => {}
                        Err(e) => warn!(error = %e, "store get failed"),
                    }
                    telemetry.time("reader.get", start);
                    if outbox.send(b).await.is_err() {
                        break;
                    }
                }
            });
        }

        tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(
                tokio::time::Instant::now() + self.scan_interval,
                self.scan_interval,
            );
            loop {
                tick.tick().await;
                let start = Instant::now();
                let cutoff = truncate_to_second(self.store.now().await);
                match self.store.scan(cutoff).await {
                    Ok(buckets) => {
                        for b in buckets {
                            if inbox_tx.send(b).await.is_err() {
                                return;
                            }
                        }
                        self.telemetry.time("reader.scan", start);
                    }
                    Err(e) => warn!(error = %e, "bucket scan failed"),
                }
            }
        });
    }
}

fn truncate_to_second(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or(t)
}
