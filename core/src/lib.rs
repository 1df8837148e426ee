//! Core library for Trilogue: one prompt, three AI providers, one transcript.
//!
//! Module map:
//! - [`agents`] holds provider configuration, the per-provider adapters and the
//!   fan-out orchestrator.
//! - [`api`] exposes the command surface the front end calls.
//! - [`credentials`] stores per-provider API keys.
//! - [`db`] initialises the SQLite database and applies migrations.
//! - [`errors`] keeps the error catalogue with codes and explanations.
//! - [`logging`] writes structured diagnostics to the event log table.
//! - [`render`] is the presentation boundary.
//! - [`session`] tracks per-session UI state.
//! - [`transcript`] is the append-only log of turns.

pub mod agents;
pub mod api;
pub mod credentials;
pub mod db;
pub mod errors;
pub mod logging;
pub mod render;
pub mod session;
pub mod transcript;
