//! Configuration module for Rotor
//!
//! Rotor is configured entirely through environment variables; there is no
//! CLI surface. `BULKER_URL` and `BULKER_AUTH_KEY` are required and boot
//! aborts without them. Everything else has a named default below.

mod defaults;

pub use defaults::*;

use crate::error::{Result, RotorError};
use std::time::Duration;

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable single-line output.
    Plain,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Plain,
        }
    }
}

/// Complete worker configuration.
///
/// Built once at boot from the process environment and shared read-only
/// across all message handlers.
#[derive(Debug, Clone)]
pub struct RotorConfig {
    /// Base URL of the bulker delivery service.
    pub bulker_url: String,
    /// Bearer token presented to bulker.
    pub bulker_auth_key: String,
    /// Port for the operator HTTP endpoints.
    pub http_port: u16,
    /// Log output format.
    pub log_format: LogFormat,
    /// Per-message processing deadline.
    pub message_deadline: Duration,
    /// TTL for cached enriched connections.
    pub connection_cache_ttl: Duration,
    /// TTL for cached function definitions.
    pub function_cache_ttl: Duration,
    /// TTL for compiled UDF wrappers (extended on access).
    pub udf_cache_ttl: Duration,
    /// Interval between cache sweep passes.
    pub cache_sweep_interval: Duration,
    /// Grace period for in-flight handlers on shutdown.
    pub shutdown_drain: Duration,
}

impl RotorConfig {
    /// Load configuration from the environment.
    ///
    /// Fails when a required variable is absent or a numeric variable does
    /// not parse.
    pub fn from_env() -> Result<Self> {
        let bulker_url = required_env("BULKER_URL")?;
        let bulker_auth_key = required_env("BULKER_AUTH_KEY")?;

        let http_port = match std::env::var("ROTOR_HTTP_PORT")
            .or_else(|_| std::env::var("PORT"))
        {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|_| RotorError::Config(format!("invalid http port '{raw}'")))?,
            Err(_) => DEFAULT_HTTP_PORT,
        };

        let log_format = std::env::var("LOG_FORMAT")
            .map(|v| LogFormat::parse(&v))
            .unwrap_or(LogFormat::Plain);

        let message_deadline = duration_env(
            "ROTOR_MESSAGE_TIMEOUT_MS",
            DEFAULT_MESSAGE_DEADLINE_MS,
        )?;

        Ok(Self {
            bulker_url: bulker_url.trim_end_matches('/').to_string(),
            bulker_auth_key,
            http_port,
            log_format,
            message_deadline,
            connection_cache_ttl: Duration::from_secs(DEFAULT_CONNECTION_CACHE_TTL_SECS),
            function_cache_ttl: Duration::from_secs(DEFAULT_FUNCTION_CACHE_TTL_SECS),
            udf_cache_ttl: Duration::from_secs(DEFAULT_UDF_CACHE_TTL_SECS),
            cache_sweep_interval: Duration::from_secs(DEFAULT_CACHE_SWEEP_INTERVAL_SECS),
            shutdown_drain: Duration::from_secs(DEFAULT_SHUTDOWN_DRAIN_SECS),
        })
    }
}

fn required_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(RotorError::Config(format!(
            "required environment variable {name} is not set"
        ))),
    }
}

fn duration_env(name: &str, default_ms: u64) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => {
            let ms = raw
                .parse::<u64>()
                .map_err(|_| RotorError::Config(format!("invalid {name} value '{raw}'")))?;
            Ok(Duration::from_millis(ms))
        }
        Err(_) => Ok(Duration::from_millis(default_ms)),
    }
}
