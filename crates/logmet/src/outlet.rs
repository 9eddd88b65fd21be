// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Takes buckets from the reader, converts them into a vendor's metric
//! records, groups them per tenant, and delivers the batches upstream.
//!
//! The pipeline is three chained stages: a CPU-bound convert pool, a
//! single grouping task that owns the per-tenant pending map (so no
//! per-tenant locks exist), and an I/O-bound post pool with bounded
//! immediate retry.

use crate::auth::Credentials;
use crate::bucket::{Bucket, Metric};
use crate::config::Config;
use crate::errors::EgressError;
use crate::telemetry::Telemetry;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, warn};

pub const DEFAULT_BATCH_CAP: usize = 300;
const GROUP_FLUSH_INTERVAL: Duration = Duration::from_millis(200);
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// The vendor-specific surface of an outlet: how a metric becomes wire
/// records, which tenant a record belongs to, and how a batch is shaped
/// into an authenticated HTTP request.
pub trait Intake: Send + Sync + 'static {
    type Payload: Serialize + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    fn convert(&self, metric: &Metric) -> Vec<Self::Payload>;

    /// The encrypted tenant credential a payload was derived from.
    fn tenant<'p>(&self, payload: &'p Self::Payload) -> &'p str;

    fn batch_cap(&self) -> usize {
        DEFAULT_BATCH_CAP
    }

    fn request(
        &self,
        client: &reqwest::Client,
        creds: &str,
        batch: &[Self::Payload],
    ) -> Result<reqwest::RequestBuilder, EgressError>;
}

pub struct Outlet<I: Intake> {
    intake: Arc<I>,
    credentials: Arc<Credentials>,
    client: reqwest::Client,
    buffer_size: usize,
    concurrency: usize,
    retries: u32,
    telemetry: Telemetry,
}

impl<I: Intake> Outlet<I> {
    pub fn new(
        cfg: &Config,
        intake: I,
        credentials: Arc<Credentials>,
        telemetry: Telemetry,
    ) -> Result<Self, EgressError> {
        let client = reqwest::Client::builder()
            .timeout(cfg.outlet_ttl)
            .connect_timeout(cfg.outlet_ttl)
            .build()?;
        Ok(Self {
            intake: Arc::new(intake),
            credentials,
            client,
            buffer_size: cfg.buffer_size,
            concurrency: cfg.concurrency,
            retries: cfg.outlet_retries,
            telemetry,
        })
    }

    /// Start the pipeline and return the inbox the reader feeds.
    pub fn start(self) -> mpsc::Sender<Bucket> {
        let (inbox_tx, inbox_rx) = mpsc::channel::<Bucket>(self.buffer_size);
        let (conv_tx, conv_rx) = mpsc::channel::<I::Payload>(self.buffer_size);
        let (outbox_tx, outbox_rx) = mpsc::channel::<Vec<I::Payload>>(self.buffer_size);

        let conv_weak = conv_tx.downgrade();
        let outbox_weak = outbox_tx.downgrade();

        // Converting is CPU bound: it reads values from memory and computes
        // statistical functions over them.
        let inbox_rx = Arc::new(Mutex::new(inbox_rx));
        for _ in 0..num_cpus::get() {
            let inbox_rx = Arc::clone(&inbox_rx);
            let conv_tx = conv_tx.clone();
            let intake = Arc::clone(&self.intake);
            let telemetry = self.telemetry.clone();
            tokio::spawn(async move {
                loop {
                    let bucket = { inbox_rx.lock().await.recv().await };
                    let Some(mut b) = bucket else { break };
                    let delay = b.id.delay(Utc::now()) as f64;
                    for metric in b.metrics() {
                        for payload in intake.convert(&metric) {
                            if conv_tx.send(payload).await.is_err() {
                                return;
                            }
                        }
                    }
                    telemetry.measure("outlet.delay", delay);
                }
            });
        }
        drop(conv_tx);

        {
            let intake = Arc::clone(&self.intake);
            tokio::spawn(Self::group_by_tenant(intake, conv_rx, outbox_tx));
        }

        let outbox_rx = Arc::new(Mutex::new(outbox_rx));
        for _ in 0..self.concurrency {
            let outbox_rx = Arc::clone(&outbox_rx);
            let intake = Arc::clone(&self.intake);
            let credentials = Arc::clone(&self.credentials);
            let client = self.client.clone();
            let telemetry = self.telemetry.clone();
            let retries = self.retries;
            tokio::spawn(async move {
                loop {
                    let batch = { outbox_rx.lock().await.recv().await };
                    let Some(batch) = batch else { break };
                    if batch.is_empty() {
                        continue;
                    }
                    // A batch holds metrics for one tenant, so the
                    // credential can come from any member.
                    let creds = match credentials.decrypt(intake.tenant(&batch[0])) {
                        Ok(creds) => creds,
                        Err(e) => {
                            error!(error = %e, "dropping batch with undecryptable credentials");
                            continue;
                        }
                    };
                    let delivered = Self::post_with_retry(
                        &intake, &client, &telemetry, retries, &creds, &batch,
                    )
                    .await;
                    if delivered.is_err() {
                        telemetry.measure("outlet.drop", 1.0);
                    }
                }
            });
        }

        // Buffer gauges; the weak handles keep this task from holding the
        // channels open after the pipeline drains.
        let name = self.intake.name();
        let telemetry = self.telemetry.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(REPORT_INTERVAL);
            loop {
                tick.tick().await;
                let (Some(conv), Some(outbox)) = (conv_weak.upgrade(), outbox_weak.upgrade())
                else {
                    break;
                };
                telemetry.measure(
                    &format!("{name}-outlet.conversion"),
                    (conv.max_capacity() - conv.capacity()) as f64,
                );
                telemetry.measure(
                    &format!("{name}-outlet.outbox"),
                    (outbox.max_capacity() - outbox.capacity()) as f64,
                );
            }
        });

        inbox_tx
    }

    /// Single-task grouping stage. Owns the per-tenant pending map; emits
    /// a batch when it reaches the cap or on the flush tick, and flushes
    /// whatever remains when the conversion stream closes.
    async fn group_by_tenant(
        intake: Arc<I>,
        mut conv_rx: mpsc::Receiver<I::Payload>,
        outbox_tx: mpsc::Sender<Vec<I::Payload>>,
    ) {
        let cap = intake.batch_cap();
        let mut pending: HashMap<String, Vec<I::Payload>> = HashMap::new();
        let mut tick = tokio::time::interval_at(
            tokio::time::Instant::now() + GROUP_FLUSH_INTERVAL,
            GROUP_FLUSH_INTERVAL,
        );
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    for (_, batch) in pending.drain() {
                        if !batch.is_empty() && outbox_tx.send(batch).await.is_err() {
                            return;
                        }
                    }
                }
                payload = conv_rx.recv() => match payload {
                    Some(payload) => {
                        let tenant = intake.tenant(&payload).to_string();
                        let full = {
                            let slot = pending.entry(tenant.clone()).or_default();
                            slot.push(payload);
                            slot.len() >= cap
                        };
                        if full {
                            if let Some(batch) = pending.remove(&tenant) {
                                if outbox_tx.send(batch).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    None => {
                        for (_, batch) in pending.drain() {
                            if !batch.is_empty() {
                                let _ = outbox_tx.send(batch).await;
                            }
                        }
                        return;
                    }
                },
            }
        }
    }

    async fn post_with_retry(
        intake: &I,
        client: &reqwest::Client,
        telemetry: &Telemetry,
        retries: u32,
        creds: &str,
        batch: &[I::Payload],
    ) -> Result<(), EgressError> {
        let mut last = EgressError::Exhausted;
        for attempt in 0..=retries {
            let start = Instant::now();
            let result = Self::post(intake, client, creds, batch).await;
            telemetry.time("outlet.post", start);
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(intake = intake.name(), attempt, error = %e, "delivery attempt failed");
                    last = e;
                }
            }
        }
        Err(last)
    }

    async fn post(
        intake: &I,
        client: &reqwest::Client,
        creds: &str,
        batch: &[I::Payload],
    ) -> Result<(), EgressError> {
        let response = intake.request(client, creds, batch)?.send().await?;
        if response.status().is_success() {
            return Ok(());
        }
        let code = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(EgressError::Status { code, body })
    }
}
