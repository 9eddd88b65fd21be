// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use logmet::auth::Credentials;
use logmet::config::Config;
use logmet::datadog::DatadogIntake;
use logmet::librato::LibratoIntake;
use logmet::outlet::{Intake, Outlet};
use logmet::reader::Reader;
use logmet::receiver::Receiver;
use logmet::server::HttpServer;
use logmet::store::Store;
use logmet::telemetry::{Telemetry, TelemetryService};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", cfg.log_level);
    #[allow(clippy::expect_used)]
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .init();

    let credentials = match Credentials::new(&cfg.secrets) {
        Ok(creds) => Arc::new(creds),
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    // The store is shared by the receiver and the outlets.
    let store = match &cfg.redis_url {
        Some(url) => match Store::shared(url, cfg.max_partitions).await {
            Ok(store) => {
                info!("initialized redis store");
                store
            }
            Err(e) => {
                error!(error = %e, "unable to connect to redis");
                std::process::exit(1);
            }
        },
        None => {
            info!("initialized memory store");
            Store::in_memory()
        }
    };

    let (telemetry, telemetry_rx) = Telemetry::channel(cfg.buffer_size);
    tokio::spawn(
        TelemetryService::new(
            telemetry_rx,
            store.clone(),
            cfg.self_metrics_auth.clone(),
            cfg.app_name.clone(),
            cfg.flush_interval,
        )
        .run(),
    );

    if cfg.use_librato_outlet {
        start_outlet(
            &cfg,
            LibratoIntake::new(),
            &store,
            &credentials,
            &telemetry,
        );
    }
    if cfg.use_datadog_outlet {
        start_outlet(
            &cfg,
            DatadogIntake::new(cfg.datadog_api_base.clone()),
            &store,
            &credentials,
            &telemetry,
        );
    }

    let receiver = if cfg.use_receiver {
        let receiver = Arc::new(Receiver::new(&cfg, store.clone(), telemetry.clone()));
        receiver.start();
        info!("receiver started");
        Some(receiver)
    } else {
        None
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    let server = HttpServer::new(
        &cfg,
        receiver.clone(),
        store,
        Arc::clone(&credentials),
        telemetry,
        cancel,
    );
    if let Err(e) = server.run().await {
        error!(error = %e, "unable to start HTTP server");
        std::process::exit(1);
    }

    // Stop accepting, then let queued requests and register flushes settle
    // before exiting. Outlet group-by ticks flush any partial batches.
    if let Some(receiver) = receiver {
        receiver.wait().await;
    }
    info!("shutdown complete");
}

fn start_outlet<I: Intake>(
    cfg: &Config,
    intake: I,
    store: &Store,
    credentials: &Arc<Credentials>,
    telemetry: &Telemetry,
) {
    let name = intake.name();
    match Outlet::new(cfg, intake, Arc::clone(credentials), telemetry.clone()) {
        Ok(outlet) => {
            let inbox = outlet.start();
            Reader::new(cfg, store.clone(), telemetry.clone()).start(inbox);
            info!(outlet = name, "outlet started");
        }
        Err(e) => {
            error!(error = %e, outlet = name, "unable to build outlet");
            std::process::exit(1);
        }
    }
}
