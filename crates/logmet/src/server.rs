// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP ingress: `/logs` for producers, `/health` for load balancers, and
//! `/sign` for issuing encrypted credentials.

use crate::auth::Credentials;
use crate::config::Config;
use crate::errors::AuthError;
use crate::parser::ReceiveOptions;
use crate::receiver::Receiver;
use crate::store::Store;
use crate::telemetry::Telemetry;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{http, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

struct Context {
    receiver: Option<Arc<Receiver>>,
    store: Store,
    credentials: Arc<Credentials>,
    telemetry: Telemetry,
}

pub struct HttpServer {
    port: u16,
    ctx: Arc<Context>,
    cancel: CancellationToken,
}

impl HttpServer {
    pub fn new(
        cfg: &Config,
        receiver: Option<Arc<Receiver>>,
        store: Store,
        credentials: Arc<Credentials>,
        telemetry: Telemetry,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            port: cfg.port,
            ctx: Arc::new(Context {
                receiver,
                store,
                credentials,
                telemetry,
            }),
            cancel,
        }
    }

    pub async fn run(self) -> io::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(&addr).await?;
        info!(port = self.port, "http server listening");
        self.serve(listener).await
    }

    /// Accept loop. When the cancel token fires the listener stops
    /// accepting, but connections already accepted are served to
    /// completion so every request either reaches the receiver (and is
    /// counted in flight) or fails back to its client.
    pub async fn serve(self, listener: TcpListener) -> io::Result<()> {
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();

        loop {
            let conn = tokio::select! {
                res = listener.accept() => match res {
                    Err(e) if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) => continue,
                    Err(e) => {
                        error!("server error: {e}");
                        return Err(e);
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("connection handler panicked: {e:?}");
                        continue;
                    }
                    Ok(()) | Err(_) => continue,
                },
                _ = self.cancel.cancelled() => break,
            };

            let io = TokioIo::new(conn);
            let server = server.clone();
            let ctx = Arc::clone(&self.ctx);
            joinset.spawn(async move {
                let service = service_fn(move |req| route(req, Arc::clone(&ctx)));
                if let Err(e) = server.serve_connection(io, service).await {
                    debug!("connection error: {e}");
                }
            });
        }

        // Dropping the set here would abort in-flight connections before
        // their requests are handed to the receiver, leaving work the
        // in-flight gate never saw. Wait them out instead.
        while joinset.join_next().await.is_some() {}
        Ok(())
    }
}

async fn route<B>(req: Request<B>, ctx: Arc<Context>) -> http::Result<Response<Full<Bytes>>>
where
    B: hyper::body::Body,
    B::Error: std::fmt::Display,
{
    match (req.method(), req.uri().path()) {
        (&Method::POST, "/logs") => handle_logs(req, &ctx).await,
        (_, "/logs") => {
            error!("non-POST method received on /logs");
            text_response(StatusCode::BAD_REQUEST, "Invalid Request")
        }
        (&Method::GET, "/health") => {
            if ctx.store.health().await {
                text_response(StatusCode::OK, "OK")
            } else {
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "store unreachable")
            }
        }
        (&Method::GET, "/sign") => handle_sign(&req, &ctx),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

async fn handle_logs<B>(req: Request<B>, ctx: &Context) -> http::Result<Response<Full<Bytes>>>
where
    B: hyper::body::Body,
    B::Error: std::fmt::Display,
{
    let start = Instant::now();
    let Some(receiver) = &ctx.receiver else {
        return text_response(StatusCode::NOT_FOUND, "Not Found");
    };

    let header = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());
    let blob = match Credentials::parse_header(header) {
        Ok(blob) => blob,
        Err(e @ AuthError::MissingHeader) => {
            error!(error = %e, "rejecting request");
            return text_response(StatusCode::BAD_REQUEST, "Missing Auth.");
        }
        Err(e) => {
            error!(error = %e, "failed to parse authorization header");
            return text_response(StatusCode::BAD_REQUEST, "Fail: Parse auth.");
        }
    };
    // Decrypting successfully is the admission check; the plaintext itself
    // is only needed later, when an outlet uses it against the vendor API.
    let user = match ctx.credentials.decrypt(&blob) {
        Ok(plain) => plain.split(':').next().unwrap_or("").to_string(),
        Err(e) => {
            error!(error = %e, "failed to decrypt credentials");
            return text_response(StatusCode::BAD_REQUEST, "Invalid Request");
        }
    };

    let mut opts = ReceiveOptions::from_query(req.uri().query().unwrap_or(""));
    opts.auth = blob;

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!(error = %e, "unable to read request body");
            return text_response(StatusCode::BAD_REQUEST, "Invalid Request");
        }
    };

    receiver.receive(body, opts).await;
    ctx.telemetry.count_req(&user);
    ctx.telemetry.time("http.accept", start);
    text_response(StatusCode::OK, "")
}

fn handle_sign<B>(req: &Request<B>, ctx: &Context) -> http::Result<Response<Full<Bytes>>> {
    let header = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());
    match ctx.credentials.sign(header) {
        Ok(blob) => text_response(StatusCode::OK, &blob),
        Err(e) => {
            error!(error = %e, "failed to sign credentials");
            text_response(StatusCode::BAD_REQUEST, "Invalid Request")
        }
    }
}

fn text_response(status: StatusCode, msg: &str) -> http::Result<Response<Full<Bytes>>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(msg.to_string())))
}
