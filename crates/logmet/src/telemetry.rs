// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Internal observability channel consumed by every pipeline component.
//!
//! Handles are cheap clones around a bounded sender and never block: a full
//! buffer drops the sample. The draining service aggregates samples into
//! one-minute buckets and, when a self-metrics tenant is configured, writes
//! them into the store so they ride the normal reader/outlet path.

use crate::bucket::{Bucket, BucketId, BucketKind};
use crate::store::Store;
use chrono::Utc;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;
use ustr::ustr;

const SELF_RESOLUTION: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct Sample {
    pub name: String,
    pub source: String,
    pub val: f64,
}

#[derive(Clone, Debug)]
pub struct Telemetry {
    tx: Option<mpsc::Sender<Sample>>,
}

impl Telemetry {
    /// A handle that drops every sample. Used when no service is running.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Build a connected handle plus the receiving end for a service.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Sample>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx: Some(tx) }, rx)
    }

    pub fn measure(&self, name: &str, val: f64) {
        self.send(name, "", val);
    }

    pub fn measure_src(&self, name: &str, source: &str, val: f64) {
        self.send(name, source, val);
    }

    /// Report the seconds elapsed since `start` under `name`.
    pub fn time(&self, name: &str, start: Instant) {
        self.measure(name, start.elapsed().as_secs_f64());
    }

    pub fn count_req(&self, user: &str) {
        self.measure_src("receiver.requests", user, 1.0);
    }

    fn send(&self, name: &str, source: &str, val: f64) {
        if let Some(tx) = &self.tx {
            // Dropping on a full buffer is deliberate; observability must
            // never apply backpressure to the pipeline.
            let _ = tx.try_send(Sample {
                name: name.to_string(),
                source: source.to_string(),
                val,
            });
        }
    }
}

pub struct TelemetryService {
    rx: mpsc::Receiver<Sample>,
    store: Store,
    auth: Option<String>,
    prefix: String,
    flush_interval: Duration,
    register: HashMap<BucketId, Bucket>,
}

impl TelemetryService {
    pub fn new(
        rx: mpsc::Receiver<Sample>,
        store: Store,
        auth: Option<String>,
        prefix: String,
        flush_interval: Duration,
    ) -> Self {
        Self {
            rx,
            store,
            auth,
            prefix,
            flush_interval,
            register: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval_at(
            tokio::time::Instant::now() + self.flush_interval,
            self.flush_interval,
        );
        loop {
            tokio::select! {
                _ = tick.tick() => self.flush().await,
                sample = self.rx.recv() => match sample {
                    Some(sample) => self.absorb(sample),
                    None => {
                        self.flush().await;
                        break;
                    }
                },
            }
        }
        debug!("telemetry service stopped");
    }

    fn absorb(&mut self, sample: Sample) {
        let name = format!("{}.{}", self.prefix, sample.name);
        let id = BucketId::new(
            self.auth.clone().unwrap_or_default(),
            ustr(&name),
            ustr(&sample.source),
            ustr(""),
            BucketKind::Measurement,
            SELF_RESOLUTION,
            Utc::now(),
        );
        self.register
            .entry(id.clone())
            .or_insert_with(|| Bucket::new(id))
            .append(sample.val);
    }

    async fn flush(&mut self) {
        if self.register.is_empty() {
            return;
        }
        let drained: Vec<Bucket> = self.register.drain().map(|(_, b)| b).collect();
        if self.auth.is_some() {
            for b in drained {
                if let Err(e) = self.store.put(b).await {
                    debug!(error = %e, "failed to store telemetry bucket");
                }
            }
        } else {
            for mut b in drained {
                let max = b.max();
                debug!(
                    name = %b.id.name,
                    source = %b.id.source,
                    count = b.count(),
                    sum = b.sum,
                    max = max,
                    "telemetry"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_samples_flow_through_channel() {
        let (tel, mut rx) = Telemetry::channel(16);
        tel.measure("receiver.drop", 1.0);
        tel.count_req("user@example.com");

        let first = rx.recv().await.expect("sample expected");
        assert_eq!(first.name, "receiver.drop");
        assert_eq!(first.val, 1.0);

        let second = rx.recv().await.expect("sample expected");
        assert_eq!(second.name, "receiver.requests");
        assert_eq!(second.source, "user@example.com");
    }

    #[tokio::test]
    async fn test_full_buffer_drops_instead_of_blocking() {
        let (tel, mut rx) = Telemetry::channel(1);
        tel.measure("a", 1.0);
        tel.measure("b", 2.0);
        assert_eq!(rx.recv().await.expect("sample expected").name, "a");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disabled_handle_is_inert() {
        let tel = Telemetry::disabled();
        tel.measure("anything", 1.0);
        tel.time("anything.time", Instant::now());
    }

    #[tokio::test]
    async fn test_service_aggregates_into_store() {
        let store = Store::in_memory();
        let (tel, rx) = Telemetry::channel(16);
        let service = TelemetryService::new(
            rx,
            store.clone(),
            Some("enc-self".to_string()),
            "logmet".to_string(),
            Duration::from_millis(20),
        );
        let handle = tokio::spawn(service.run());

        tel.measure("receiver.drop", 1.0);
        tel.measure("receiver.drop", 1.0);
        drop(tel);
        handle.await.expect("service task failed");

        let cutoff = Utc::now() + chrono::Duration::seconds(120);
        let scanned = store.scan(cutoff).await.expect("scan should succeed");
        assert_eq!(scanned.len(), 1);
        let b = &scanned[0];
        assert_eq!(b.id.name.as_str(), "logmet.receiver.drop");
        assert_eq!(b.sum, 2.0);
        assert_eq!(b.id.auth, "enc-self");
    }
}
