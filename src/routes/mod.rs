// ABOUTME: Route module organization for the chat relay HTTP endpoints
// ABOUTME: Bundles shared server resources handed to every route group
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Route module for the chat relay server
//!
//! Each domain module contains route definitions and thin handler functions
//! that delegate to the service layer.

/// Conversation management and streaming chat routes
pub mod chat;
/// Health check and readiness routes
pub mod health;

pub use chat::ChatRoutes;
pub use health::HealthRoutes;

use std::sync::Arc;

use crate::database::ChatStore;
use crate::services::RelayService;

/// Shared resources injected into route handlers
pub struct ServerResources {
    /// Conversation and turn persistence
    pub store: Arc<ChatStore>,
    /// Streaming completion orchestrator
    pub relay: Arc<RelayService>,
}

impl ServerResources {
    /// Bundle the store and relay service for router state
    #[must_use]
    pub const fn new(store: Arc<ChatStore>, relay: Arc<RelayService>) -> Self {
        Self { store, relay }
    }
}
