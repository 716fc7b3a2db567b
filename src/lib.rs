// ABOUTME: Main library entry point for the streaming chat completion relay
// ABOUTME: Provides durable multi-turn conversations over an OpenAI-compatible upstream
//
// SPDX-License-Identifier: MIT OR Apache-2.0

#![deny(unsafe_code)]

//! # Chat Relay Server
//!
//! A server that lets a client hold a multi-turn text conversation with a
//! remote LLM completion service, streaming the reply incrementally while
//! durably recording every turn.
//!
//! ## Architecture
//!
//! - **Upstream client** (`llm::upstream`): request construction, retry with
//!   backoff, and SSE stream decoding against an OpenAI-compatible endpoint
//! - **Relay orchestrator** (`services::relay`): drives one completion turn
//!   end-to-end with bounded-channel backpressure and exactly-once finalize
//! - **Persistence** (`database`): SQLite-backed conversations and turns with
//!   soft delete
//! - **Routes** (`routes`): conversation CRUD, the streaming `/api/chat`
//!   endpoint, and health checks
//!
//! ## Example
//!
//! ```rust,no_run
//! use chat_relay_server::config::ServerConfig;
//! use chat_relay_server::errors::AppResult;
//!
//! #[tokio::main]
//! async fn main() -> AppResult<()> {
//!     let config = ServerConfig::from_env()?;
//!     println!("Chat relay configured on HTTP port {}", config.http_port);
//!     Ok(())
//! }
//! ```

/// Configuration management from environment variables
pub mod config;

/// Conversation and turn persistence over SQLite
pub mod database;

/// Unified error handling system with standard error codes and HTTP responses
pub mod errors;

/// Upstream completion client, SSE decoder, and shared completion types
pub mod llm;

/// Production logging and structured output
pub mod logging;

/// `HTTP` routes for conversation management and streaming chat
pub mod routes;

/// Domain service layer with the relay orchestrator
pub mod services;
