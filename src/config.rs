// ABOUTME: Environment-driven server configuration loaded once at startup
// ABOUTME: Covers HTTP port, database URL, and upstream completion service settings
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Server Configuration
//!
//! All configuration comes from environment variables (optionally via a
//! `.env` file) and is immutable after startup.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::llm::{RetryPolicy, UpstreamConfig};

/// Default HTTP listen port
const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default SQLite database location
const DEFAULT_DATABASE_URL: &str = "sqlite:chat_relay.db";

/// Default upstream base URL (local Ollama)
const DEFAULT_UPSTREAM_BASE_URL: &str = "http://localhost:11434/v1";

/// Default upstream model
const DEFAULT_UPSTREAM_MODEL: &str = "qwen2.5:14b-instruct";

/// Default per-chunk timeout in seconds
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;

/// Upstream service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    /// Base URL of the OpenAI-compatible API
    pub base_url: String,
    /// Bearer token (may be empty for local servers)
    pub api_key: String,
    /// Default model name
    pub model: String,
    /// Per-chunk timeout in seconds (also covers time to first byte)
    pub timeout_secs: u64,
    /// Maximum retry attempts for connect errors and 5xx responses
    pub max_retries: u32,
    /// Base backoff delay in milliseconds
    pub retry_base_delay_ms: u64,
    /// Default max tokens per completion
    pub max_tokens: Option<u32>,
    /// Default sampling temperature
    pub temperature: Option<f32>,
}

/// Server configuration loaded from the environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP API port
    pub http_port: u16,
    /// Database connection URL
    pub database_url: String,
    /// Upstream completion service settings
    pub upstream: UpstreamSettings,
}

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` when a numeric variable fails to parse.
    pub fn from_env() -> AppResult<Self> {
        info!("Loading configuration from environment variables");

        if let Err(e) = dotenvy::dotenv() {
            warn!("No .env file found or failed to load: {e}");
        }

        let config = Self {
            http_port: parse_env("HTTP_PORT", DEFAULT_HTTP_PORT)?,
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_owned()),
            upstream: UpstreamSettings {
                base_url: env::var("UPSTREAM_BASE_URL")
                    .unwrap_or_else(|_| DEFAULT_UPSTREAM_BASE_URL.to_owned()),
                api_key: env::var("UPSTREAM_API_KEY").unwrap_or_default(),
                model: env::var("UPSTREAM_MODEL")
                    .unwrap_or_else(|_| DEFAULT_UPSTREAM_MODEL.to_owned()),
                timeout_secs: parse_env("UPSTREAM_TIMEOUT_SECS", DEFAULT_UPSTREAM_TIMEOUT_SECS)?,
                max_retries: parse_env("UPSTREAM_MAX_RETRIES", 3)?,
                retry_base_delay_ms: parse_env("UPSTREAM_RETRY_BASE_DELAY_MS", 500)?,
                max_tokens: parse_env_opt("UPSTREAM_MAX_TOKENS")?,
                temperature: parse_env_opt("UPSTREAM_TEMPERATURE")?,
            },
        };

        info!(
            "Configuration loaded: http_port={}, upstream={}, model={}",
            config.http_port, config.upstream.base_url, config.upstream.model
        );

        Ok(config)
    }

    /// Build the upstream client configuration
    #[must_use]
    pub fn upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig {
            base_url: self.upstream.base_url.clone(),
            api_key: self.upstream.api_key.clone(),
            default_model: self.upstream.model.clone(),
            default_temperature: self.upstream.temperature,
            default_max_tokens: self.upstream.max_tokens,
            chunk_timeout: Duration::from_secs(self.upstream.timeout_secs),
            retry: RetryPolicy {
                max_retries: self.upstream.max_retries,
                base_delay: Duration::from_millis(self.upstream.retry_base_delay_ms),
            },
        }
    }
}

/// Parse an environment variable with a default
fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> AppResult<T> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| AppError::config(format!("Invalid {name} value: {value}"))),
        Err(_) => Ok(default),
    }
}

/// Parse an optional environment variable
fn parse_env_opt<T: std::str::FromStr>(name: &str) -> AppResult<Option<T>> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| AppError::config(format!("Invalid {name} value: {value}"))),
        Err(_) => Ok(None),
    }
}
