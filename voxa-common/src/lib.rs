//! Shared infrastructure for Voxa services.
//!
//! Provides the unified configuration file and structured logging used by
//! the session orchestrator, the retrieval service and the agent binary.

pub mod config;
pub mod logging;

pub use config::Config;
