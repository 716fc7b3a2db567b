// ABOUTME: Repository traits decoupling services from concrete persistence
// ABOUTME: Exposes the turn repository contract consumed by the relay orchestrator
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Repositories
//!
//! Trait seams between the service layer and the SQLite store. Services hold
//! `Arc<dyn TurnRepository>`, which lets tests substitute in-memory fakes.

pub mod turn_repository;

pub use turn_repository::TurnRepository;
