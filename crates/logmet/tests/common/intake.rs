// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process stand-in for a vendor metrics intake.
//!
//! The outlet's post workers deliver JSON envelopes over HTTP; this fake
//! records each delivery with its query string and parsed envelope so
//! tests can assert on exactly what was shipped, and answers everything
//! with a fixed status to drive the success and retry paths.

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

/// One delivery observed by the intake.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub method: String,
    pub path: String,
    pub query: String,
    /// The request body parsed as JSON; `Null` when it was not JSON.
    pub envelope: serde_json::Value,
}

#[derive(Clone)]
pub struct MockIntake {
    addr: SocketAddr,
    deliveries: Arc<Mutex<Vec<Delivery>>>,
}

impl MockIntake {
    /// Bind a local port and answer every delivery with `status`.
    pub async fn start(status: u16) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock intake");
        let addr = listener.local_addr().expect("mock intake addr");
        let deliveries: Arc<Mutex<Vec<Delivery>>> = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&deliveries);
        tokio::spawn(async move {
            // Post workers deliver concurrently over separate pooled
            // connections, so each connection gets its own task.
            while let Ok((stream, _)) = listener.accept().await {
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let service = service_fn(move |req| record(req, Arc::clone(&log), status));
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, deliveries }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    /// Every entry of every `{"series": [...]}` envelope shipped so far,
    /// in arrival order. Batches may split on the outlet's group tick, so
    /// assertions should aggregate over this rather than a single
    /// delivery.
    pub fn series_entries(&self) -> Vec<serde_json::Value> {
        self.deliveries()
            .iter()
            .filter_map(|d| d.envelope.get("series").and_then(|s| s.as_array()).cloned())
            .flatten()
            .collect()
    }
}

async fn record(
    req: Request<Incoming>,
    log: Arc<Mutex<Vec<Delivery>>>,
    status: u16,
) -> hyper::http::Result<Response<Full<Bytes>>> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();
    let envelope = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);

    log.lock().unwrap().push(Delivery {
        method,
        path,
        query,
        envelope,
    });

    Response::builder()
        .status(StatusCode::from_u16(status).expect("valid status"))
        .body(Full::new(Bytes::from(r#"{"status":"ok"}"#)))
}
