// ABOUTME: HTTP routes for conversation management and the streaming chat endpoint
// ABOUTME: Thin handlers delegating to ChatStore and RelayService, SSE for completions
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Chat Routes
//!
//! Conversation CRUD plus the streaming completion endpoint. The streaming
//! endpoint re-emits relay events as SSE: JSON chunk objects, a literal
//! `[DONE]` sentinel on success, or a single `{"error": ...}` object when the
//! turn fails after streaming has begun.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_stream::{Stream, StreamExt};
use tracing::error;

use super::ServerResources;
use crate::database::{ConversationRecord, TurnRecord};
use crate::errors::AppError;
use crate::services::RelayEvent;

/// Default page size when listing conversations
const DEFAULT_LIST_LIMIT: i64 = 50;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for creating a conversation
#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    /// Optional initial title; empty means derive from the first message
    #[serde(default)]
    pub title: Option<String>,
}

/// Request body for renaming a conversation
#[derive(Debug, Deserialize)]
pub struct UpdateConversationRequest {
    /// New title
    pub title: String,
}

/// Request body for the streaming chat endpoint
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    /// Target conversation
    pub conversation_id: i64,
    /// User message to relay
    pub message: String,
}

/// Conversation payload returned by the API
#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationResponse {
    /// Conversation ID
    pub id: i64,
    /// Conversation title
    pub title: String,
    /// Creation timestamp (ISO 8601)
    pub created_at: String,
    /// Last update timestamp (ISO 8601)
    pub updated_at: String,
}

impl From<ConversationRecord> for ConversationResponse {
    fn from(record: ConversationRecord) -> Self {
        Self {
            id: record.id,
            title: record.title,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// List of conversations with the returned count
#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationListResponse {
    /// Conversations, most recently updated first
    pub conversations: Vec<ConversationResponse>,
    /// Number of conversations in this page
    pub total: usize,
}

/// Turn payload returned by the API
#[derive(Debug, Serialize, Deserialize)]
pub struct TurnResponse {
    /// Turn ID
    pub id: i64,
    /// Sender role
    pub role: String,
    /// Turn content
    pub content: String,
    /// Estimated token count, when finalized
    pub token_count: Option<i64>,
    /// Generation time in milliseconds, when finalized
    pub duration_ms: Option<i64>,
    /// Creation timestamp (ISO 8601)
    pub created_at: String,
}

impl From<TurnRecord> for TurnResponse {
    fn from(record: TurnRecord) -> Self {
        Self {
            id: record.id,
            role: record.role,
            content: record.content,
            token_count: record.token_count,
            duration_ms: record.duration_ms,
            created_at: record.created_at,
        }
    }
}

/// List of turns in a conversation, oldest first
#[derive(Debug, Serialize, Deserialize)]
pub struct TurnListResponse {
    /// Turns, oldest first
    pub turns: Vec<TurnResponse>,
}

/// Pagination query parameters
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Page size (default 50)
    pub limit: Option<i64>,
    /// Page offset (default 0)
    pub offset: Option<i64>,
}

// ============================================================================
// Routes
// ============================================================================

/// Chat routes implementation
pub struct ChatRoutes;

impl ChatRoutes {
    /// Create all chat routes
    pub fn routes(resources: Arc<ServerResources>) -> Router {
        Router::new()
            // Conversation management
            .route("/api/conversations", post(Self::create_conversation))
            .route("/api/conversations", get(Self::list_conversations))
            .route("/api/conversations/:id", get(Self::get_conversation))
            .route("/api/conversations/:id", put(Self::update_conversation))
            .route("/api/conversations/:id", delete(Self::delete_conversation))
            .route("/api/conversations/:id/turns", get(Self::list_turns))
            // Streaming completion relay
            .route("/api/chat", post(Self::chat_completion))
            .with_state(resources)
    }

    /// Create a conversation
    async fn create_conversation(
        State(resources): State<Arc<ServerResources>>,
        Json(request): Json<CreateConversationRequest>,
    ) -> Result<impl IntoResponse, AppError> {
        let title = request.title.unwrap_or_default();
        let record = resources.store.create_conversation(&title).await?;

        Ok((
            StatusCode::CREATED,
            Json(ConversationResponse::from(record)),
        ))
    }

    /// List active conversations
    async fn list_conversations(
        State(resources): State<Arc<ServerResources>>,
        Query(query): Query<ListQuery>,
    ) -> Result<Json<ConversationListResponse>, AppError> {
        let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).max(0);
        let offset = query.offset.unwrap_or(0).max(0);

        let conversations: Vec<ConversationResponse> = resources
            .store
            .list_conversations(limit, offset)
            .await?
            .into_iter()
            .map(ConversationResponse::from)
            .collect();

        let total = conversations.len();
        Ok(Json(ConversationListResponse {
            conversations,
            total,
        }))
    }

    /// Fetch a single conversation
    async fn get_conversation(
        State(resources): State<Arc<ServerResources>>,
        Path(id): Path<i64>,
    ) -> Result<Json<ConversationResponse>, AppError> {
        let record = resources
            .store
            .get_conversation(id)
            .await?
            .ok_or_else(|| AppError::not_found("Conversation"))?;

        Ok(Json(ConversationResponse::from(record)))
    }

    /// Rename a conversation
    async fn update_conversation(
        State(resources): State<Arc<ServerResources>>,
        Path(id): Path<i64>,
        Json(request): Json<UpdateConversationRequest>,
    ) -> Result<Json<ConversationResponse>, AppError> {
        let changed = resources
            .store
            .update_conversation_title(id, &request.title)
            .await?;
        if !changed {
            return Err(AppError::not_found("Conversation"));
        }

        let record = resources
            .store
            .get_conversation(id)
            .await?
            .ok_or_else(|| AppError::not_found("Conversation"))?;

        Ok(Json(ConversationResponse::from(record)))
    }

    /// Soft-delete a conversation
    async fn delete_conversation(
        State(resources): State<Arc<ServerResources>>,
        Path(id): Path<i64>,
    ) -> Result<StatusCode, AppError> {
        let changed = resources.store.delete_conversation(id).await?;
        if !changed {
            return Err(AppError::not_found("Conversation"));
        }

        Ok(StatusCode::NO_CONTENT)
    }

    /// List the turns of a conversation, oldest first
    async fn list_turns(
        State(resources): State<Arc<ServerResources>>,
        Path(id): Path<i64>,
    ) -> Result<Json<TurnListResponse>, AppError> {
        resources
            .store
            .get_conversation(id)
            .await?
            .ok_or_else(|| AppError::not_found("Conversation"))?;

        let turns = resources
            .store
            .list_turns(id, false)
            .await?
            .into_iter()
            .map(TurnResponse::from)
            .collect();

        Ok(Json(TurnListResponse { turns }))
    }

    /// Relay one completion turn as an SSE stream
    async fn chat_completion(
        State(resources): State<Arc<ServerResources>>,
        Json(request): Json<ChatCompletionRequest>,
    ) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
        let mut relay_stream = resources
            .relay
            .stream_completion(request.conversation_id, &request.message)
            .await?;

        let stream = async_stream::stream! {
            while let Some(event) = relay_stream.next().await {
                match event {
                    RelayEvent::Chunk(chunk) => match serde_json::to_string(&chunk) {
                        Ok(json) => yield Ok(Event::default().data(json)),
                        Err(e) => error!("Failed to serialize chunk event: {e}"),
                    },
                    RelayEvent::Done => {
                        yield Ok(Event::default().data("[DONE]"));
                    }
                    RelayEvent::Error(message) => {
                        let body = serde_json::json!({ "error": message });
                        yield Ok(Event::default().data(body.to_string()));
                    }
                }
            }
        };

        Ok(Sse::new(stream))
    }
}
