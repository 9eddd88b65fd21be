// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reads log requests, extracts measurements, aggregates them in an
//! in-memory register, and flushes the register into the store.
//!
//! Keeping a register decouples store writes from HTTP requests: many
//! requests within a flush interval collapse into one bucket per identity.

use crate::bucket::{Bucket, BucketId};
use crate::config::Config;
use crate::parser::{self, ReceiveOptions};
use crate::store::Store;
use crate::telemetry::Telemetry;
use chrono::Utc;
use hyper::body::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as TokioMutex, Notify};
use tracing::{error, info};

/// The body of an HTTP request plus its query options, passed between the
/// handler and the accept workers.
pub struct LogRequest {
    pub body: Bytes,
    pub opts: ReceiveOptions,
}

/// Counts work the receiver has accepted but not yet settled: one token
/// per queued request and one per bucket awaiting a store write. `wait`
/// resolving means it is safe to shut the process down.
struct InFlight {
    count: AtomicI64,
    notify: Notify,
}

impl InFlight {
    fn new() -> Self {
        Self {
            count: AtomicI64::new(0),
            notify: Notify::new(),
        }
    }

    fn add(&self, n: i64) {
        self.count.fetch_add(n, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.count.load(Ordering::SeqCst) <= 0 {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Clone)]
pub struct Receiver {
    register: Arc<Mutex<HashMap<BucketId, Bucket>>>,
    inbox_tx: mpsc::Sender<LogRequest>,
    inbox_rx: Arc<TokioMutex<mpsc::Receiver<LogRequest>>>,
    outbox_tx: mpsc::Sender<Bucket>,
    outbox_rx: Arc<TokioMutex<mpsc::Receiver<Bucket>>>,
    in_flight: Arc<InFlight>,
    store: Store,
    telemetry: Telemetry,
    concurrency: usize,
    flush_interval: Duration,
    /// Resolution units a bucket may lag behind before it is dropped.
    deadline: i64,
    num_buckets: Arc<AtomicU64>,
    num_reqs: Arc<AtomicU64>,
}

impl Receiver {
    pub fn new(cfg: &Config, store: Store, telemetry: Telemetry) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(cfg.buffer_size);
        let (outbox_tx, outbox_rx) = mpsc::channel(cfg.buffer_size);
        Self {
            register: Arc::new(Mutex::new(HashMap::new())),
            inbox_tx,
            inbox_rx: Arc::new(TokioMutex::new(inbox_rx)),
            outbox_tx,
            outbox_rx: Arc::new(TokioMutex::new(outbox_rx)),
            in_flight: Arc::new(InFlight::new()),
            store,
            telemetry,
            concurrency: cfg.concurrency,
            flush_interval: cfg.flush_interval,
            deadline: cfg.receiver_deadline,
            num_buckets: Arc::new(AtomicU64::new(0)),
            num_reqs: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start moving data through the receiver's pipeline.
    pub fn start(&self) {
        // Accepting is mostly CPU bound (parsing); writing to the store
        // blocks on I/O. Both pools share the configured size.
        for _ in 0..self.concurrency {
            let r = self.clone();
            tokio::spawn(r.accept());
        }
        for _ in 0..self.concurrency {
            let r = self.clone();
            tokio::spawn(r.store_buckets());
        }
        let r = self.clone();
        tokio::spawn(r.schedule_transfer());
        let r = self.clone();
        tokio::spawn(r.report());
    }

    /// Enqueue a request for asynchronous processing; returns as soon as
    /// the inbox accepts it.
    pub async fn receive(&self, body: Bytes, opts: ReceiveOptions) {
        self.num_reqs.fetch_add(1, Ordering::Relaxed);
        self.in_flight.add(1);
        if self.inbox_tx.send(LogRequest { body, opts }).await.is_err() {
            self.in_flight.done();
            error!("receiver inbox is closed");
        }
    }

    /// Blocks until everything accepted so far has been parsed and written
    /// to the store. The shutdown hook.
    pub async fn wait(&self) {
        self.in_flight.wait().await;
    }

    async fn accept(self) {
        loop {
            let req = { self.inbox_rx.lock().await.recv().await };
            let Some(req) = req else { break };
            let start = Instant::now();
            // The local clock stands in for the store clock here; calling
            // out to the backend per request would dominate the parse
            // loop. The reader re-checks readiness against store time, so
            // drift cannot cause double-reporting.
            let store_time = Utc::now();
            for b in parser::build_buckets(&req.body, &req.opts, &self.telemetry) {
                if b.id.delay(store_time) <= self.deadline {
                    self.in_flight.add(1);
                    self.add_register(b);
                } else {
                    self.telemetry.measure("receiver.drop", 1.0);
                }
            }
            self.telemetry.time("receiver.accept", start);
            self.in_flight.done();
        }
    }

    fn add_register(&self, b: Bucket) {
        #[allow(clippy::expect_used)]
        let mut register = self.register.lock().expect("lock poisoned");
        self.num_buckets.fetch_add(1, Ordering::Relaxed);
        match register.get_mut(&b.id) {
            Some(existing) => {
                self.telemetry.measure("receiver.merge-bucket", 1.0);
                existing.merge(b);
            }
            None => {
                self.telemetry.measure("receiver.add-bucket", 1.0);
                register.insert(b.id.clone(), b);
            }
        }
    }

    async fn schedule_transfer(self) {
        let mut tick = tokio::time::interval_at(
            tokio::time::Instant::now() + self.flush_interval,
            self.flush_interval,
        );
        loop {
            tick.tick().await;
            self.transfer().await;
        }
    }

    /// The transfer is not a concurrent process: the register is emptied
    /// in one critical section, so a bucket is either in this flush or the
    /// next, never half-merged.
    async fn transfer(&self) {
        let drained: Vec<Bucket> = {
            #[allow(clippy::expect_used)]
            let mut register = self.register.lock().expect("lock poisoned");
            register.drain().map(|(_, b)| b).collect()
        };
        for b in drained {
            if self.outbox_tx.send(b).await.is_err() {
                self.in_flight.done();
            }
        }
    }

    async fn store_buckets(self) {
        loop {
            let b = { self.outbox_rx.lock().await.recv().await };
            let Some(b) = b else { break };
            let start = Instant::now();
            if let Err(e) = self.store.put(b).await {
                error!(error = %e, "store put failed");
            }
            self.telemetry.time("receiver.outlet", start);
            self.in_flight.done();
        }
    }

    /// Keep an eye on throughput and buffer depths. Maxed-out buffers mean
    /// something downstream is wedged.
    async fn report(self) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tick.tick().await;
            let num_buckets = self.num_buckets.swap(0, Ordering::Relaxed);
            let num_reqs = self.num_reqs.swap(0, Ordering::Relaxed);
            info!(num_buckets, num_reqs, "receiver");
            self.telemetry.measure(
                "receiver.buffer.inbox",
                (self.inbox_tx.max_capacity() - self.inbox_tx.capacity()) as f64,
            );
            self.telemetry.measure(
                "receiver.buffer.outbox",
                (self.outbox_tx.max_capacity() - self.outbox_tx.capacity()) as f64,
            );
        }
    }
}
