// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::ConfigError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_BUFFER_SIZE: usize = 1024;
const DEFAULT_CONCURRENCY: usize = 10;
const DEFAULT_DATADOG_API_BASE: &str = "https://app.datadoghq.com";

/// Runtime configuration for all pipeline roles. Combines the process
/// environment with defaults; every value is fixed at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server's bind port.
    pub port: u16,
    /// Prefix internal telemetry metric names with this value.
    pub app_name: String,
    /// Max number of items for all internal buffers.
    pub buffer_size: usize,
    /// Worker pool size for the receiver, reader and outlets.
    pub concurrency: usize,
    /// Time to wait before flushing the register to the store.
    pub flush_interval: Duration,
    /// Time to wait between store scans.
    pub outlet_interval: Duration,
    /// Deadline set on outlet HTTP requests.
    pub outlet_ttl: Duration,
    /// Number of additional attempts to deliver a batch.
    pub outlet_retries: u32,
    /// Number of store partitions to scan.
    pub max_partitions: usize,
    /// Number of resolution units to pass before dropping incoming logs.
    pub receiver_deadline: i64,
    /// When set, buckets are coordinated through Redis instead of memory.
    pub redis_url: Option<String>,
    /// Keys used to decrypt incoming credentials. Rotated front to back.
    pub secrets: Vec<String>,
    pub use_receiver: bool,
    pub use_datadog_outlet: bool,
    pub use_librato_outlet: bool,
    pub datadog_api_base: String,
    /// Encrypted credential under which self-telemetry is reported.
    pub self_metrics_auth: Option<String>,
    /// Log level (e.g. trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            app_name: "logmet".to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            flush_interval: Duration::from_secs(1),
            outlet_interval: Duration::from_secs(1),
            outlet_ttl: Duration::from_secs(2),
            outlet_retries: 2,
            max_partitions: 1,
            receiver_deadline: 2,
            redis_url: None,
            secrets: Vec::new(),
            use_receiver: false,
            use_datadog_outlet: false,
            use_librato_outlet: false,
            datadog_api_base: DEFAULT_DATADOG_API_BASE.to_string(),
            self_metrics_auth: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Create configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let secrets: Vec<String> = env::var("SECRETS")
            .map_err(|_| ConfigError::MissingEnv("SECRETS"))?
            .split(':')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if secrets.is_empty() {
            return Err(ConfigError::MissingEnv("SECRETS"));
        }

        let config = Self {
            port: env_or("PORT", DEFAULT_PORT),
            app_name: env::var("APP_NAME").unwrap_or_else(|_| "logmet".to_string()),
            buffer_size: env_or("BUFFER_SIZE", DEFAULT_BUFFER_SIZE),
            concurrency: env_or("CONCURRENCY", DEFAULT_CONCURRENCY),
            flush_interval: Duration::from_secs(env_or("FLUSH_INTERVAL", 1u64)),
            outlet_interval: Duration::from_secs(env_or("OUTLET_INTERVAL", 1u64)),
            outlet_ttl: Duration::from_secs(env_or("OUTLET_TTL", 2u64)),
            outlet_retries: env_or("OUTLET_RETRY", 2u32),
            max_partitions: env_or("PARTITIONS", 1usize),
            receiver_deadline: env_or("RECV_DEADLINE", 2i64),
            redis_url: env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            secrets,
            use_receiver: env_bool("RECEIVER"),
            use_datadog_outlet: env_bool("OUTLET_DATADOG"),
            use_librato_outlet: env_bool("OUTLET_LIBRATO"),
            datadog_api_base: env::var("DATADOG_API_BASE")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_DATADOG_API_BASE.to_string()),
            self_metrics_auth: env::var("SELF_METRICS_AUTH").ok().filter(|s| !s.is_empty()),
            log_level: env::var("LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or_else(|_| "info".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid(
                "PORT must be greater than 0".to_string(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "BUFFER_SIZE must be greater than 0".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "CONCURRENCY must be greater than 0".to_string(),
            ));
        }
        if self.max_partitions == 0 {
            return Err(ConfigError::Invalid(
                "PARTITIONS must be greater than 0".to_string(),
            ));
        }
        if self.flush_interval.is_zero() || self.outlet_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "FLUSH_INTERVAL and OUTLET_INTERVAL must be greater than 0".to_string(),
            ));
        }
        if self.outlet_ttl.is_zero() {
            return Err(ConfigError::Invalid(
                "OUTLET_TTL must be greater than 0".to_string(),
            ));
        }
        if self.receiver_deadline < 0 {
            return Err(ConfigError::Invalid(
                "RECV_DEADLINE must not be negative".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}

fn env_or<T: FromStr + Copy>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str) -> bool {
    env::var(name)
        .map(|v| {
            let v = v.to_lowercase();
            v == "true" || v == "1"
        })
        .unwrap_or(false)
}
