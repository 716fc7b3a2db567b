// ABOUTME: Database operations for conversations and their turns
// ABOUTME: Handles conversation CRUD with soft delete and turn persistence
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::errors::{AppError, AppResult};
use crate::llm::MessageRole;

// ============================================================================
// Database Record Types
// ============================================================================

/// Database representation of a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    /// Conversation ID (SQLite rowid)
    pub id: i64,
    /// Conversation title (auto-derived or user-defined)
    pub title: String,
    /// When the conversation was created (ISO 8601)
    pub created_at: String,
    /// When the conversation was last updated (ISO 8601)
    pub updated_at: String,
}

/// Database representation of a single turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    /// Turn ID
    pub id: i64,
    /// Conversation this turn belongs to
    pub conversation_id: i64,
    /// Role of the sender (system, user, assistant)
    pub role: String,
    /// Turn content
    pub content: String,
    /// Estimated token count, set when the reply is finalized
    pub token_count: Option<i64>,
    /// Wall-clock generation time in milliseconds
    pub duration_ms: Option<i64>,
    /// When the turn was created (ISO 8601); assigns ordering
    pub created_at: String,
}

// ============================================================================
// Chat Store
// ============================================================================

/// Conversation and turn persistence over a SQLite pool
pub struct ChatStore {
    pool: SqlitePool,
}

impl ChatStore {
    /// Create a new store
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ========================================================================
    // Conversation Operations
    // ========================================================================

    /// Create a new conversation
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    pub async fn create_conversation(&self, title: &str) -> AppResult<ConversationRecord> {
        let now = chrono::Utc::now().to_rfc3339();

        let result = sqlx::query(
            r"
            INSERT INTO conversations (title, created_at, updated_at)
            VALUES ($1, $2, $2)
            ",
        )
        .bind(title)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create conversation: {e}")))?;

        Ok(ConversationRecord {
            id: result.last_insert_rowid(),
            title: title.to_owned(),
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Get an active conversation by ID
    ///
    /// Soft-deleted conversations are treated as absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    pub async fn get_conversation(
        &self,
        conversation_id: i64,
    ) -> AppResult<Option<ConversationRecord>> {
        let row = sqlx::query(
            r"
            SELECT id, title, created_at, updated_at
            FROM conversations
            WHERE id = $1 AND deleted_at IS NULL
            ",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to get conversation: {e}")))?;

        Ok(row.map(|r| ConversationRecord {
            id: r.get("id"),
            title: r.get("title"),
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
        }))
    }

    /// List active conversations, most recently updated first
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    pub async fn list_conversations(
        &self,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<ConversationRecord>> {
        let rows = sqlx::query(
            r"
            SELECT id, title, created_at, updated_at
            FROM conversations
            WHERE deleted_at IS NULL
            ORDER BY updated_at DESC
            LIMIT $1 OFFSET $2
            ",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to list conversations: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|r| ConversationRecord {
                id: r.get("id"),
                title: r.get("title"),
                created_at: r.get("created_at"),
                updated_at: r.get("updated_at"),
            })
            .collect())
    }

    /// Update a conversation title, returning whether a row changed
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    pub async fn update_conversation_title(
        &self,
        conversation_id: i64,
        title: &str,
    ) -> AppResult<bool> {
        let now = chrono::Utc::now().to_rfc3339();

        let result = sqlx::query(
            r"
            UPDATE conversations
            SET title = $1, updated_at = $2
            WHERE id = $3 AND deleted_at IS NULL
            ",
        )
        .bind(title)
        .bind(&now)
        .bind(conversation_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to update conversation title: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Soft-delete a conversation, returning whether a row changed
    ///
    /// Turns are retained; the conversation simply stops resolving.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    pub async fn delete_conversation(&self, conversation_id: i64) -> AppResult<bool> {
        let now = chrono::Utc::now().to_rfc3339();

        let result = sqlx::query(
            r"
            UPDATE conversations
            SET deleted_at = $1
            WHERE id = $2 AND deleted_at IS NULL
            ",
        )
        .bind(&now)
        .bind(conversation_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to delete conversation: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Turn Operations
    // ========================================================================

    /// Append a turn to a conversation
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    pub async fn append_turn(
        &self,
        conversation_id: i64,
        role: MessageRole,
        content: &str,
    ) -> AppResult<TurnRecord> {
        let now = chrono::Utc::now().to_rfc3339();

        let result = sqlx::query(
            r"
            INSERT INTO turns (conversation_id, role, content, created_at)
            VALUES ($1, $2, $3, $4)
            ",
        )
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(content)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to append turn: {e}")))?;

        Ok(TurnRecord {
            id: result.last_insert_rowid(),
            conversation_id,
            role: role.as_str().to_owned(),
            content: content.to_owned(),
            token_count: None,
            duration_ms: None,
            created_at: now,
        })
    }

    /// Overwrite the content of a turn
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    pub async fn update_turn_content(&self, turn_id: i64, content: &str) -> AppResult<()> {
        sqlx::query("UPDATE turns SET content = $1 WHERE id = $2")
            .bind(content)
            .bind(turn_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to update turn content: {e}")))?;

        Ok(())
    }

    /// Set the generation metrics of a turn
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    pub async fn update_turn_metrics(
        &self,
        turn_id: i64,
        token_count: i64,
        duration_ms: i64,
    ) -> AppResult<()> {
        sqlx::query("UPDATE turns SET token_count = $1, duration_ms = $2 WHERE id = $3")
            .bind(token_count)
            .bind(duration_ms)
            .bind(turn_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to update turn metrics: {e}")))?;

        Ok(())
    }

    /// List the turns of a conversation, oldest first
    ///
    /// With `exclude_system` set, system turns are left out (used when
    /// building upstream context).
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    pub async fn list_turns(
        &self,
        conversation_id: i64,
        exclude_system: bool,
    ) -> AppResult<Vec<TurnRecord>> {
        let query = if exclude_system {
            r"
            SELECT id, conversation_id, role, content, token_count, duration_ms, created_at
            FROM turns
            WHERE conversation_id = $1 AND role != 'system'
            ORDER BY created_at ASC, id ASC
            "
        } else {
            r"
            SELECT id, conversation_id, role, content, token_count, duration_ms, created_at
            FROM turns
            WHERE conversation_id = $1
            ORDER BY created_at ASC, id ASC
            "
        };

        let rows = sqlx::query(query)
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to list turns: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|r| TurnRecord {
                id: r.get("id"),
                conversation_id: r.get("conversation_id"),
                role: r.get("role"),
                content: r.get("content"),
                token_count: r.get("token_count"),
                duration_ms: r.get("duration_ms"),
                created_at: r.get("created_at"),
            })
            .collect())
    }
}
