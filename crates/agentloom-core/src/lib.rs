//! # Agentloom Core
//!
//! Shared data model, collaborator traits, error taxonomy, and configuration
//! for the Agentloom orchestration runtime.
//!
//! ## Layout
//! ```text
//! types   — Task, Objective, TaskResult, drafts and filters
//! traits  — Executor, Observer, TaskStore, Publisher
//! error   — LoomError + Result alias
//! config  — LoomConfig (TOML, ~/.agentloom/config.toml)
//! ```

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::LoomConfig;
pub use error::{LoomError, Result};
pub use traits::{Executor, Observer, Publisher, TaskStore};
pub use types::*;
