// ABOUTME: SQLite pool creation and embedded schema bootstrap
// ABOUTME: Provides the connection pool shared by all persistence operations
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Database Layer
//!
//! SQLite-backed persistence for conversations and turns. The schema is
//! bootstrapped at startup so the server can run against an empty database
//! file; there is no migration machinery beyond that.

pub mod chat;
pub mod repositories;

pub use chat::{ChatStore, ConversationRecord, TurnRecord};

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::errors::{AppError, AppResult};

/// Maximum connections held by the pool
const MAX_CONNECTIONS: u32 = 5;

/// Create a connection pool and ensure the schema exists
///
/// Accepts `sqlite:` URLs, including `sqlite::memory:` for tests. The
/// database file is created when missing.
///
/// # Errors
///
/// Returns an error if the URL is invalid, the pool cannot connect, or the
/// schema bootstrap fails.
pub async fn create_pool(database_url: &str) -> AppResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| AppError::config(format!("Invalid DATABASE_URL: {e}")))?
        .create_if_missing(true);

    // In-memory databases exist per connection; a larger pool would hand out
    // empty databases alongside the bootstrapped one
    let max_connections = if database_url.contains(":memory:") {
        1
    } else {
        MAX_CONNECTIONS
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(|e| AppError::database(format!("Failed to connect to database: {e}")))?;

    bootstrap_schema(&pool).await?;

    info!("Database ready at {database_url}");
    Ok(pool)
}

/// Create the tables and indexes used by the relay
async fn bootstrap_schema(pool: &SqlitePool) -> AppResult<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS conversations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        )
        ",
    )
    .execute(pool)
    .await
    .map_err(|e| AppError::database(format!("Failed to create conversations table: {e}")))?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS turns (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL REFERENCES conversations(id),
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            token_count INTEGER,
            duration_ms INTEGER,
            created_at TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await
    .map_err(|e| AppError::database(format!("Failed to create turns table: {e}")))?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_turns_conversation
        ON turns (conversation_id, created_at)
        ",
    )
    .execute(pool)
    .await
    .map_err(|e| AppError::database(format!("Failed to create turns index: {e}")))?;

    Ok(())
}
