// ABOUTME: Relay orchestrator driving one streaming completion turn end-to-end
// ABOUTME: Validates, persists turns, streams deltas with backpressure, finalizes exactly once
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Relay Orchestrator
//!
//! Drives a single completion turn: validate the conversation, derive a title
//! when missing, persist the user turn and an empty placeholder assistant
//! turn, build the upstream context, stream deltas to the caller while
//! accumulating the full reply, and flush content plus metrics exactly once
//! when the stream ends.
//!
//! The caller consumes a bounded channel. A consumer that stalls past the
//! configured timeout (or disconnects) causes the upstream connection to be
//! dropped; whatever was accumulated up to that point is still finalized.
//! The placeholder turn is never deleted, so a failed request leaves a
//! visible, possibly partial, assistant turn.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::database::repositories::TurnRepository;
use crate::database::TurnRecord;
use crate::errors::{AppError, AppResult};
use crate::llm::{ChatMessage, CompletionBackend, CompletionRequest, DeltaEvent, MessageRole};

/// Titles longer than this are truncated with an ellipsis
const TITLE_MAX_CHARS: usize = 30;

/// Characters kept before the ellipsis when truncating
const TITLE_TRUNCATED_CHARS: usize = 27;

/// Estimated tokens per whitespace-separated word
const TOKENS_PER_WORD: f64 = 1.3;

// ============================================================================
// Caller-Facing Events
// ============================================================================

/// One event emitted to the relay's own client
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// An incremental completion chunk
    Chunk(ChunkEvent),
    /// The stream finished; the caller should emit the `[DONE]` sentinel
    Done,
    /// The turn failed; always the last event when present
    Error(String),
}

/// OpenAI-shaped chunk re-emitted to the client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkEvent {
    /// Upstream completion id, passed through
    pub id: String,
    /// Always `chat.completion.chunk`
    pub object: String,
    /// Upstream creation timestamp, passed through
    pub created: i64,
    /// Model that produced the chunk, passed through
    pub model: String,
    /// Single-choice payload
    pub choices: Vec<ChunkChoice>,
}

/// Choice entry within a chunk event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    /// Always 0; the relay requests a single choice
    pub index: u32,
    /// Content fragment
    pub delta: ChunkDelta,
    /// Finish reason on the closing chunk
    pub finish_reason: Option<String>,
}

/// Delta payload within a choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDelta {
    /// Content fragment, omitted when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChunkEvent {
    fn from_delta(event: DeltaEvent) -> Self {
        Self {
            id: event.id,
            object: "chat.completion.chunk".to_owned(),
            created: event.created,
            model: event.model,
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    content: event.content,
                },
                finish_reason: event.finish_reason,
            }],
        }
    }
}

// ============================================================================
// Relay Service
// ============================================================================

/// Tuning knobs for the relay
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Bounded channel capacity between producer task and consumer
    pub channel_capacity: usize,
    /// How long a send may stall before the consumer is considered gone
    pub stall_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            channel_capacity: 32,
            stall_timeout: Duration::from_secs(10),
        }
    }
}

/// Orchestrates streaming completion turns
pub struct RelayService {
    repository: Arc<dyn TurnRepository>,
    backend: Arc<dyn CompletionBackend>,
    settings: RelaySettings,
}

impl RelayService {
    /// Create a new relay service
    #[must_use]
    pub fn new(
        repository: Arc<dyn TurnRepository>,
        backend: Arc<dyn CompletionBackend>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            repository,
            backend,
            settings,
        }
    }

    /// Run one streaming completion turn
    ///
    /// Validates the conversation and persists the user turn plus an empty
    /// placeholder assistant turn before returning. The returned stream then
    /// carries the re-emitted chunks; upstream failures surface as a single
    /// [`RelayEvent::Error`] item rather than an `Err` return, since by that
    /// point the persisted rows already exist.
    ///
    /// # Errors
    ///
    /// Returns an error when the message is blank, the conversation does not
    /// exist (or is soft-deleted), or a persistence write fails before
    /// streaming starts.
    pub async fn stream_completion(
        &self,
        conversation_id: i64,
        message: &str,
    ) -> AppResult<ReceiverStream<RelayEvent>> {
        if message.trim().is_empty() {
            return Err(AppError::invalid_input("Message must not be blank"));
        }

        let conversation = self
            .repository
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| AppError::not_found("Conversation"))?;

        if conversation.title.trim().is_empty() {
            let title = derive_title(message);
            self.repository
                .update_conversation_title(conversation_id, &title)
                .await?;
            debug!("Derived title for conversation {conversation_id}: {title}");
        }

        self.repository
            .append_turn(conversation_id, MessageRole::User, message)
            .await?;

        // Placeholder is overwritten on success and intentionally kept on failure
        let placeholder = self
            .repository
            .append_turn(conversation_id, MessageRole::Assistant, "")
            .await?;

        let history = self.repository.list_turns(conversation_id, true).await?;
        let context = build_context(&history);

        let request = CompletionRequest::new(context).with_streaming();

        let (tx, rx) = mpsc::channel(self.settings.channel_capacity);
        let repository = Arc::clone(&self.repository);
        let backend = Arc::clone(&self.backend);
        let stall_timeout = self.settings.stall_timeout;

        tokio::spawn(async move {
            run_turn(
                &*backend,
                &*repository,
                &request,
                &placeholder,
                &tx,
                stall_timeout,
            )
            .await;
        });

        Ok(ReceiverStream::new(rx))
    }
}

/// Producer task body: stream, accumulate, finalize
async fn run_turn(
    backend: &dyn CompletionBackend,
    repository: &dyn TurnRepository,
    request: &CompletionRequest,
    placeholder: &TurnRecord,
    tx: &mpsc::Sender<RelayEvent>,
    stall_timeout: Duration,
) {
    let started = Instant::now();
    let mut accumulated = String::new();

    let mut stream = match backend.complete_stream(request).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Upstream stream failed to start: {e}");
            send_best_effort(tx, RelayEvent::Error(e.message), stall_timeout).await;
            return;
        }
    };

    let mut failed = false;

    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                if let Some(fragment) = event.content.as_deref() {
                    accumulated.push_str(fragment);
                }

                let sent = send_with_stall_timeout(
                    tx,
                    RelayEvent::Chunk(ChunkEvent::from_delta(event)),
                    stall_timeout,
                )
                .await;
                if !sent {
                    // Consumer gone or stalled; drop the upstream connection
                    warn!("Consumer stalled or disconnected, abandoning upstream stream");
                    break;
                }
            }
            Err(e) => {
                warn!("Upstream stream error mid-turn: {e}");
                send_best_effort(tx, RelayEvent::Error(e.message), stall_timeout).await;
                failed = true;
                break;
            }
        }
    }

    drop(stream);

    if !failed {
        send_best_effort(tx, RelayEvent::Done, stall_timeout).await;
    }

    // Partial content from a failed turn is persisted too; an empty
    // accumulator leaves the placeholder as created with no metrics.
    if accumulated.is_empty() {
        debug!("Turn produced no content, placeholder left untouched");
        return;
    }

    let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
    let token_count = estimate_tokens(&accumulated);

    if let Err(e) = repository
        .update_turn_content(placeholder.id, &accumulated)
        .await
    {
        error!("Failed to persist assistant turn {}: {e}", placeholder.id);
        return;
    }
    if let Err(e) = repository
        .update_turn_metrics(placeholder.id, token_count, elapsed_ms)
        .await
    {
        error!(
            "Failed to persist metrics for turn {}: {e}",
            placeholder.id
        );
        return;
    }

    info!(
        "Finalized turn {}: {} chars, ~{token_count} tokens in {elapsed_ms}ms",
        placeholder.id,
        accumulated.len()
    );
}

/// Send an event, treating a stalled or closed channel as consumer loss
async fn send_with_stall_timeout(
    tx: &mpsc::Sender<RelayEvent>,
    event: RelayEvent,
    stall_timeout: Duration,
) -> bool {
    matches!(
        tokio::time::timeout(stall_timeout, tx.send(event)).await,
        Ok(Ok(()))
    )
}

/// Send a terminal event without caring whether anyone is still listening
async fn send_best_effort(
    tx: &mpsc::Sender<RelayEvent>,
    event: RelayEvent,
    stall_timeout: Duration,
) {
    let _ = tokio::time::timeout(stall_timeout, tx.send(event)).await;
}

/// Derive a conversation title from the first user message
///
/// Messages longer than 30 characters keep the first 27 followed by `...`,
/// so the result never exceeds 30 characters.
#[must_use]
pub fn derive_title(message: &str) -> String {
    if message.chars().count() > TITLE_MAX_CHARS {
        let mut title: String = message.chars().take(TITLE_TRUNCATED_CHARS).collect();
        title.push_str("...");
        title
    } else {
        message.to_owned()
    }
}

/// Estimate token usage from whitespace-separated word count
#[must_use]
pub fn estimate_tokens(content: &str) -> i64 {
    let words = content.split_whitespace().count();
    (words as f64 * TOKENS_PER_WORD).floor() as i64
}

/// Build upstream context from persisted turns
///
/// System turns are excluded by the repository query; blank turns (such as
/// the just-created placeholder) are excluded here. Order is preserved,
/// oldest first.
fn build_context(history: &[TurnRecord]) -> Vec<ChatMessage> {
    history
        .iter()
        .filter(|turn| !turn.content.trim().is_empty())
        .map(|turn| ChatMessage::new(MessageRole::from_str_or_user(&turn.role), &turn.content))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_short_message_verbatim() {
        assert_eq!(derive_title("Hi"), "Hi");
        // Exactly at the limit stays untouched
        let exact: String = "x".repeat(30);
        assert_eq!(derive_title(&exact), exact);
    }

    #[test]
    fn test_title_long_message_truncated() {
        let title = derive_title("Tell me about the solar system in detail");
        assert_eq!(title, "Tell me about the solar sys...");
        assert_eq!(title.chars().count(), 30);
    }

    #[test]
    fn test_title_truncation_counts_chars_not_bytes() {
        let message: String = "é".repeat(40);
        let title = derive_title(&message);
        assert_eq!(title.chars().count(), 30);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("one"), 1);
        // 10 words * 1.3 = 13
        assert_eq!(estimate_tokens("a b c d e f g h i j"), 13);
        // 3 words * 1.3 = 3.9, floored
        assert_eq!(estimate_tokens("one two three"), 3);
    }

    #[test]
    fn test_build_context_skips_blank_turns() {
        let turns = vec![
            TurnRecord {
                id: 1,
                conversation_id: 1,
                role: "user".to_owned(),
                content: "hello".to_owned(),
                token_count: None,
                duration_ms: None,
                created_at: "2026-01-01T00:00:00Z".to_owned(),
            },
            TurnRecord {
                id: 2,
                conversation_id: 1,
                role: "assistant".to_owned(),
                content: String::new(),
                token_count: None,
                duration_ms: None,
                created_at: "2026-01-01T00:00:01Z".to_owned(),
            },
            TurnRecord {
                id: 3,
                conversation_id: 1,
                role: "assistant".to_owned(),
                content: "  ".to_owned(),
                token_count: None,
                duration_ms: None,
                created_at: "2026-01-01T00:00:02Z".to_owned(),
            },
        ];

        let context = build_context(&turns);
        assert_eq!(context.len(), 1);
        assert_eq!(context[0].content, "hello");
        assert_eq!(context[0].role, MessageRole::User);
    }

    #[test]
    fn test_chunk_event_shape() {
        let event = ChunkEvent::from_delta(DeltaEvent {
            id: "c-1".to_owned(),
            created: 1_700_000_000,
            model: "m".to_owned(),
            content: Some("hi".to_owned()),
            finish_reason: None,
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["object"], "chat.completion.chunk");
        assert_eq!(json["choices"][0]["index"], 0);
        assert_eq!(json["choices"][0]["delta"]["content"], "hi");
        assert!(json["choices"][0]["finish_reason"].is_null());
    }

    #[test]
    fn test_chunk_event_omits_absent_content() {
        let event = ChunkEvent::from_delta(DeltaEvent {
            id: "c-1".to_owned(),
            created: 1,
            model: "m".to_owned(),
            content: None,
            finish_reason: Some("stop".to_owned()),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert!(json["choices"][0]["delta"].get("content").is_none());
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
    }
}
