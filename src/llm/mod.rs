// ABOUTME: Core types for upstream chat completion requests and streamed deltas
// ABOUTME: Defines the completion backend contract implemented by the upstream client
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Upstream Completion Types
//!
//! Shared types for talking to an OpenAI-compatible chat completion service:
//! role-tagged messages, request configuration, whole-body responses, and the
//! incremental delta events produced by streaming mode.
//!
//! The [`CompletionBackend`] trait is the seam between the relay orchestrator
//! and the concrete HTTP client, which keeps the orchestrator testable against
//! scripted backends.

pub mod sse;
pub mod upstream;

pub use sse::{decode_delta_stream, SseFrame, SseLineBuffer};
pub use upstream::{RetryPolicy, UpstreamClient, UpstreamConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

use crate::errors::AppError;

// ============================================================================
// Message Types
// ============================================================================

/// Role of a message in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instruction message
    System,
    /// User input message
    User,
    /// Assistant response message
    Assistant,
}

impl MessageRole {
    /// Convert to string representation for API calls and persistence
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Parse a stored role string, defaulting unknown values to `User`
    #[must_use]
    pub fn from_str_or_user(value: &str) -> Self {
        match value {
            "system" => Self::System,
            "assistant" => Self::Assistant,
            _ => Self::User,
        }
    }
}

/// A single message in a chat conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message sender
    pub role: MessageRole,
    /// Content of the message
    pub content: String,
}

impl ChatMessage {
    /// Create a new chat message
    #[must_use]
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a system message
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Create a user message
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create an assistant message
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Configuration for a chat completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Conversation messages, oldest first
    pub messages: Vec<ChatMessage>,
    /// Model identifier (falls back to the client default)
    pub model: Option<String>,
    /// Temperature for response randomness (0.0 - 2.0)
    pub temperature: Option<f32>,
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
    /// Whether to stream the response
    pub stream: bool,
}

impl CompletionRequest {
    /// Create a new completion request with messages
    #[must_use]
    pub const fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            model: None,
            temperature: None,
            max_tokens: None,
            stream: false,
        }
    }

    /// Set the model to use
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the temperature
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the maximum tokens
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Enable streaming
    #[must_use]
    pub const fn with_streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// Response from a non-streaming chat completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Generated message content
    pub content: String,
    /// Model used for generation
    pub model: String,
    /// Token usage statistics
    pub usage: Option<TokenUsage>,
    /// Finish reason (stop, length, etc.)
    pub finish_reason: Option<String>,
}

/// Token usage statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of tokens in the prompt
    pub prompt_tokens: u32,
    /// Number of tokens in the completion
    pub completion_tokens: u32,
    /// Total tokens used
    pub total_tokens: u32,
}

/// A decoded event from an upstream streaming response
///
/// Pass-through identifiers (`id`, `created`, `model`) come straight from the
/// upstream chunk so the relay can re-emit them to its own client unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaEvent {
    /// Upstream completion id
    pub id: String,
    /// Unix timestamp assigned by the upstream
    pub created: i64,
    /// Model that produced this chunk
    pub model: String,
    /// Content fragment, absent for role-only or final chunks
    pub content: Option<String>,
    /// Finish reason when the upstream closes the choice
    pub finish_reason: Option<String>,
}

/// Stream type for decoded completion deltas
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<DeltaEvent, AppError>> + Send>>;

// ============================================================================
// Backend Trait
// ============================================================================

/// Completion backend contract consumed by the relay orchestrator
///
/// The production implementation is [`UpstreamClient`]. Tests substitute
/// scripted backends to exercise orchestrator behavior under failure.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Perform a chat completion (non-streaming)
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, AppError>;

    /// Perform a streaming chat completion
    ///
    /// Returns a stream of decoded delta events consumed incrementally.
    async fn complete_stream(&self, request: &CompletionRequest) -> Result<DeltaStream, AppError>;
}
