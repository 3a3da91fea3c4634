#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Huntsman Core
//!
//! Distributed orchestration core for remote live-forensics fleets.
//!
//! ## Overview
//!
//! Analysts drive agents through **flows**: persisted, resumable state
//! machines that issue requests to one agent and react to its responses.
//! **Hunts** fan a flow out to every client matching a rule, the
//! **foreman** evaluates those rules as clients check in, and the **cron
//! scheduler** starts hunts and flows on a recurring schedule.
//!
//! All state lives in a shared store, so any number of coordinator
//! processes can run side by side. Work moves between them through a leased
//! queue with at-least-once delivery; every handler is idempotent.
//!
//! ## Module Organization
//!
//! - [`models`] - persisted records: flows, requests, hunts, rules, cron jobs
//! - [`database`] - storage traits with in-memory and PostgreSQL backends
//! - [`flows`] - flow definitions, the flow context and the registry
//! - [`orchestration`] - runner, queue, foreman, hunts, cron and system wiring
//! - [`rules`] - client-selection rules
//! - [`state_machine`] - flow, hunt and cron run lifecycles
//! - [`config`] - YAML configuration with environment overrides
//! - [`events`] - operator event channel
//! - [`logging`] - structured logging setup and helpers
//! - [`error`] - structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use huntsman_core::config::HuntsmanConfig;
//! use huntsman_core::database::InMemoryDataStore;
//! use huntsman_core::flows::FlowRegistry;
//! use huntsman_core::orchestration::{LoggingTransport, OrchestrationSystem};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let system = OrchestrationSystem::new(
//!     HuntsmanConfig::default(),
//!     Arc::new(InMemoryDataStore::new()),
//!     FlowRegistry::with_builtin_flows()?,
//!     Arc::new(LoggingTransport),
//! );
//! system.run().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod events;
pub mod flows;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod rules;
pub mod state_machine;

pub use error::{HuntsmanError, Result};
