// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Converts a formatted log stream into time-bucketed metrics and ships
//! them to metric APIs.
//!
//! Pipeline: [`parser`] turns request bodies into buckets, [`receiver`]
//! aggregates them in memory and flushes to the [`store`], [`reader`]
//! scans the store for ready buckets, and [`outlet`] converts, batches and
//! delivers them to a vendor intake ([`datadog`] or [`librato`]).

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod auth;
pub mod bucket;
pub mod config;
pub mod datadog;
pub mod errors;
pub mod librato;
pub mod outlet;
pub mod parser;
pub mod reader;
pub mod receiver;
pub mod redis_store;
pub mod server;
pub mod store;
pub mod telemetry;
