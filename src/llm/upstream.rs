// ABOUTME: HTTP client for the OpenAI-compatible upstream completion service
// ABOUTME: Owns request construction, retry/backoff, and both whole-body and streaming decode
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Upstream Completion Client
//!
//! Client for an `OpenAI`-compatible `chat/completions` endpoint. Both the
//! streaming and non-streaming paths share one payload builder so request
//! parameters mean the same thing in either mode.
//!
//! ## Retry behavior
//!
//! Retries cover only the initial HTTP exchange. Once bytes start flowing, the
//! stream is never retried (the client may have already consumed partial
//! output).
//!
//! - **429**: sleeps for the `Retry-After` header value when present, else the
//!   base delay, and retries without consuming a retry attempt.
//! - **Connect errors, header-wait timeouts, and 5xx**: exponential backoff
//!   (`base_delay * 2^(attempt-1)`), up to `max_retries` attempts.
//! - **Any other non-2xx**: terminal immediately.
//!
//! The per-chunk timeout bounds every wait on the upstream: response headers,
//! the non-streaming body read, and each streamed chunk.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::unfold;
use futures_util::StreamExt;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use super::sse::decode_delta_stream;
use super::{
    ChatMessage, CompletionBackend, CompletionRequest, CompletionResponse, DeltaStream, TokenUsage,
};
use crate::errors::AppError;

/// Connection timeout for the upstream service
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Service label used in error messages
const SERVICE_NAME: &str = "upstream";

// ============================================================================
// Wire Types (OpenAI-compatible format)
// ============================================================================

/// Request body for the `chat/completions` endpoint
#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

/// Message structure on the wire
#[derive(Debug, Clone, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

impl From<&ChatMessage> for WireMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role.as_str().to_owned(),
            content: msg.content.clone(),
        }
    }
}

/// Whole-body response structure
#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

/// Error body structure
#[derive(Debug, Deserialize)]
struct WireErrorResponse {
    error: WireErrorDetail,
}

#[derive(Debug, Deserialize)]
struct WireErrorDetail {
    message: String,
}

// ============================================================================
// Configuration
// ============================================================================

/// Retry policy for the initial HTTP exchange
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts for connect errors and 5xx responses
    pub max_retries: u32,
    /// Base delay; attempt `n` sleeps `base_delay * 2^(n-1)`
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff delay for a given 1-based attempt number
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1_u32 << attempt.saturating_sub(1).min(31))
    }
}

/// Configuration for the upstream completion client
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL of the OpenAI-compatible API (without `/chat/completions`)
    pub base_url: String,
    /// Bearer token for the `Authorization` header
    pub api_key: String,
    /// Model requested when the completion request does not name one
    pub default_model: String,
    /// Default temperature applied when the request does not set one
    pub default_temperature: Option<f32>,
    /// Default max tokens applied when the request does not set one
    pub default_max_tokens: Option<u32>,
    /// Per-chunk timeout; also covers time to first byte
    pub chunk_timeout: Duration,
    /// Retry policy for the initial exchange
    pub retry: RetryPolicy,
}

// ============================================================================
// Client
// ============================================================================

/// HTTP client for the upstream completion service
///
/// Holds no state beyond construction-time configuration; safe to share
/// across concurrent completion turns.
pub struct UpstreamClient {
    client: Client,
    config: UpstreamConfig,
}

impl UpstreamClient {
    /// Create a new client with the given configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: UpstreamConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| AppError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    /// Build the wire payload shared by streaming and non-streaming mode
    fn build_payload(&self, request: &CompletionRequest, stream: bool) -> WireRequest {
        WireRequest {
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.config.default_model.clone()),
            messages: request.messages.iter().map(WireMessage::from).collect(),
            stream,
            temperature: request.temperature.or(self.config.default_temperature),
            max_tokens: request.max_tokens.or(self.config.default_max_tokens),
        }
    }

    /// Reject requests with no usable message content
    fn validate(request: &CompletionRequest) -> Result<(), AppError> {
        if request
            .messages
            .iter()
            .all(|m| m.content.trim().is_empty())
        {
            return Err(AppError::invalid_input(
                "Completion request must carry at least one non-blank message",
            ));
        }
        Ok(())
    }

    /// Parse the `Retry-After` header as whole seconds
    fn retry_after(response: &Response) -> Option<Duration> {
        response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// Turn a terminal non-2xx response body into an error
    fn parse_error_response(status: StatusCode, body: &str) -> AppError {
        let detail = serde_json::from_str::<WireErrorResponse>(body)
            .map_or_else(
                |_| body.chars().take(200).collect::<String>(),
                |e| e.error.message,
            );
        AppError::external_service(SERVICE_NAME, format!("API error ({status}): {detail}"))
    }

    /// Account a retryable failure against the budget, sleeping before the
    /// next attempt or returning the terminal error once the budget is spent
    async fn backoff_or_give_up(&self, attempt: &mut u32, reason: &str) -> Result<(), AppError> {
        *attempt += 1;
        if *attempt > self.config.retry.max_retries {
            error!(
                "{reason}; giving up after {} attempts",
                self.config.retry.max_retries
            );
            return Err(AppError::external_unavailable(
                SERVICE_NAME,
                format!(
                    "{reason} after {} attempts",
                    self.config.retry.max_retries
                ),
            ));
        }
        let delay = self.config.retry.delay_for_attempt(*attempt);
        warn!(
            "{reason}, retry {attempt}/{} in {}ms",
            self.config.retry.max_retries,
            delay.as_millis()
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }

    /// Send the request, applying the retry policy to the initial exchange
    ///
    /// The chunk timeout also bounds the wait for response headers, so an
    /// upstream that accepts the connection and then goes silent counts as a
    /// retryable failure rather than hanging the request.
    async fn send_with_retry(&self, payload: &WireRequest) -> Result<Response, AppError> {
        let url = self.completions_url();
        let mut attempt: u32 = 0;

        loop {
            let send = self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {}", self.config.api_key))
                .json(payload)
                .send();

            let response = match tokio::time::timeout(self.config.chunk_timeout, send).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) if e.is_connect() || e.is_timeout() => {
                    self.backoff_or_give_up(
                        &mut attempt,
                        &format!("Cannot connect to {}: {e}", self.config.base_url),
                    )
                    .await?;
                    continue;
                }
                Ok(Err(e)) => {
                    return Err(AppError::external_service(
                        SERVICE_NAME,
                        format!("Request failed: {e}"),
                    ));
                }
                Err(_) => {
                    self.backoff_or_give_up(
                        &mut attempt,
                        &format!(
                            "No response within {}s",
                            self.config.chunk_timeout.as_secs()
                        ),
                    )
                    .await?;
                    continue;
                }
            };

            let status = response.status();

            if status.is_success() {
                return Ok(response);
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                // Rate limiting does not consume the retry budget
                let delay = Self::retry_after(&response).unwrap_or(self.config.retry.base_delay);
                warn!(
                    "Upstream rate limited, waiting {}ms before retrying",
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            if status.is_server_error() {
                self.backoff_or_give_up(&mut attempt, &format!("Upstream returned {status}"))
                    .await?;
                continue;
            }

            // Client errors are terminal
            let body = response.text().await.unwrap_or_default();
            return Err(Self::parse_error_response(status, &body));
        }
    }
}

/// Cut off a delta stream when no chunk arrives within the timeout
///
/// Also bounds the wait for the first chunk of the stream.
fn with_chunk_timeout(stream: DeltaStream, timeout: Duration) -> DeltaStream {
    Box::pin(unfold(
        (stream, false),
        move |(mut stream, ended)| async move {
            if ended {
                return None;
            }
            match tokio::time::timeout(timeout, stream.next()).await {
                Ok(Some(item)) => Some((item, (stream, false))),
                Ok(None) => None,
                Err(_) => Some((
                    Err(AppError::external_unavailable(
                        SERVICE_NAME,
                        format!("No stream data within {}s", timeout.as_secs()),
                    )),
                    (stream, true),
                )),
            }
        },
    ))
}

#[async_trait]
impl CompletionBackend for UpstreamClient {
    #[instrument(skip(self, request), fields(model = %request.model.as_deref().unwrap_or(&self.config.default_model)))]
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, AppError> {
        Self::validate(request)?;

        let payload = self.build_payload(request, false);
        let response = self.send_with_retry(&payload).await?;

        let body = tokio::time::timeout(self.config.chunk_timeout, response.text())
            .await
            .map_err(|_| {
                AppError::external_unavailable(
                    SERVICE_NAME,
                    format!(
                        "No response body within {}s",
                        self.config.chunk_timeout.as_secs()
                    ),
                )
            })?
            .map_err(|e| {
                AppError::external_service(SERVICE_NAME, format!("Failed to read response: {e}"))
            })?;

        let wire: WireResponse = serde_json::from_str(&body).map_err(|e| {
            error!(
                "Failed to parse completion response: {e} - body: {}",
                &body[..body.len().min(500)]
            );
            AppError::external_service(SERVICE_NAME, format!("Failed to parse response: {e}"))
        })?;

        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AppError::external_service(SERVICE_NAME, "API returned no choices"))?;

        let content = choice.message.content.unwrap_or_default();

        debug!(
            "Received completion: {} chars, finish_reason: {:?}",
            content.len(),
            choice.finish_reason
        );

        Ok(CompletionResponse {
            content,
            model: wire.model,
            usage: wire.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
            finish_reason: choice.finish_reason,
        })
    }

    #[instrument(skip(self, request), fields(model = %request.model.as_deref().unwrap_or(&self.config.default_model)))]
    async fn complete_stream(&self, request: &CompletionRequest) -> Result<DeltaStream, AppError> {
        Self::validate(request)?;

        let payload = self.build_payload(request, true);
        let response = self.send_with_retry(&payload).await?;

        debug!("Upstream stream opened");

        let decoded = decode_delta_stream(response.bytes_stream());
        Ok(with_chunk_timeout(decoded, self.config.chunk_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MessageRole;

    fn test_config() -> UpstreamConfig {
        UpstreamConfig {
            base_url: "http://localhost:9/v1/".to_owned(),
            api_key: "test-key".to_owned(),
            default_model: "default-model".to_owned(),
            default_temperature: Some(0.7),
            default_max_tokens: Some(1024),
            chunk_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn test_completions_url_strips_trailing_slash() {
        let client = UpstreamClient::new(test_config()).unwrap();
        assert_eq!(
            client.completions_url(),
            "http://localhost:9/v1/chat/completions"
        );
    }

    #[test]
    fn test_payload_falls_back_to_defaults() {
        let client = UpstreamClient::new(test_config()).unwrap();
        let request = CompletionRequest::new(vec![ChatMessage::user("hi")]);
        let payload = client.build_payload(&request, true);

        assert_eq!(payload.model, "default-model");
        assert_eq!(payload.temperature, Some(0.7));
        assert_eq!(payload.max_tokens, Some(1024));
        assert!(payload.stream);
    }

    #[test]
    fn test_payload_request_overrides_defaults() {
        let client = UpstreamClient::new(test_config()).unwrap();
        let request = CompletionRequest::new(vec![ChatMessage::user("hi")])
            .with_model("other-model")
            .with_temperature(0.1)
            .with_max_tokens(8);
        let payload = client.build_payload(&request, false);

        assert_eq!(payload.model, "other-model");
        assert_eq!(payload.temperature, Some(0.1));
        assert_eq!(payload.max_tokens, Some(8));
        assert!(!payload.stream);
    }

    #[test]
    fn test_validate_rejects_blank_messages() {
        let request = CompletionRequest::new(vec![ChatMessage::new(MessageRole::User, "   ")]);
        assert!(UpstreamClient::validate(&request).is_err());

        let request = CompletionRequest::new(vec![]);
        assert!(UpstreamClient::validate(&request).is_err());

        let request = CompletionRequest::new(vec![ChatMessage::user("hello")]);
        assert!(UpstreamClient::validate(&request).is_ok());
    }

    #[test]
    fn test_parse_error_response_prefers_json_message() {
        let body = r#"{"error":{"message":"model is overloaded","type":"server_error"}}"#;
        let error = UpstreamClient::parse_error_response(StatusCode::BAD_REQUEST, body);
        assert!(error.message.contains("model is overloaded"));

        let error = UpstreamClient::parse_error_response(StatusCode::BAD_REQUEST, "plain text");
        assert!(error.message.contains("plain text"));
    }
}
