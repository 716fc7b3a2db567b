// ABOUTME: Turn repository trait consumed by the relay orchestrator
// ABOUTME: Implemented by ChatStore; single-row atomicity, failures surface as DatabaseError
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use async_trait::async_trait;

use crate::database::chat::{ChatStore, ConversationRecord, TurnRecord};
use crate::errors::AppResult;
use crate::llm::MessageRole;

/// Persistence contract for conversation turns
///
/// Each operation is an independent single-row write or read. The repository
/// never retries; callers decide what a failure means for the request in
/// flight.
#[async_trait]
pub trait TurnRepository: Send + Sync {
    /// Fetch an active conversation, `None` when absent or soft-deleted
    async fn get_conversation(&self, conversation_id: i64)
        -> AppResult<Option<ConversationRecord>>;

    /// Replace a conversation title, returning whether a row changed
    async fn update_conversation_title(&self, conversation_id: i64, title: &str)
        -> AppResult<bool>;

    /// Append a turn and return the stored record
    async fn append_turn(
        &self,
        conversation_id: i64,
        role: MessageRole,
        content: &str,
    ) -> AppResult<TurnRecord>;

    /// Overwrite the content of an existing turn
    async fn update_turn_content(&self, turn_id: i64, content: &str) -> AppResult<()>;

    /// Set the generation metrics of an existing turn
    async fn update_turn_metrics(
        &self,
        turn_id: i64,
        token_count: i64,
        duration_ms: i64,
    ) -> AppResult<()>;

    /// List turns oldest first, optionally without system turns
    async fn list_turns(
        &self,
        conversation_id: i64,
        exclude_system: bool,
    ) -> AppResult<Vec<TurnRecord>>;
}

#[async_trait]
impl TurnRepository for ChatStore {
    async fn get_conversation(
        &self,
        conversation_id: i64,
    ) -> AppResult<Option<ConversationRecord>> {
        Self::get_conversation(self, conversation_id).await
    }

    async fn update_conversation_title(
        &self,
        conversation_id: i64,
        title: &str,
    ) -> AppResult<bool> {
        Self::update_conversation_title(self, conversation_id, title).await
    }

    async fn append_turn(
        &self,
        conversation_id: i64,
        role: MessageRole,
        content: &str,
    ) -> AppResult<TurnRecord> {
        Self::append_turn(self, conversation_id, role, content).await
    }

    async fn update_turn_content(&self, turn_id: i64, content: &str) -> AppResult<()> {
        Self::update_turn_content(self, turn_id, content).await
    }

    async fn update_turn_metrics(
        &self,
        turn_id: i64,
        token_count: i64,
        duration_ms: i64,
    ) -> AppResult<()> {
        Self::update_turn_metrics(self, turn_id, token_count, duration_ms).await
    }

    async fn list_turns(
        &self,
        conversation_id: i64,
        exclude_system: bool,
    ) -> AppResult<Vec<TurnRecord>> {
        Self::list_turns(self, conversation_id, exclude_system).await
    }
}
