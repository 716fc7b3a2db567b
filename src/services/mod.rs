// ABOUTME: Domain service layer between HTTP routes and persistence/upstream
// ABOUTME: Hosts the relay orchestrator that drives one completion turn end-to-end
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Services
//!
//! Protocol-agnostic business logic. Routes stay thin; the relay service owns
//! the lifecycle of a completion turn.

pub mod relay;

pub use relay::{RelayEvent, RelayService, RelaySettings};
