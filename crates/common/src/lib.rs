//! CiteGraph Common Library
//!
//! Shared code for the CiteGraph discovery engine including:
//! - Database models, schema bootstrap and the graph store
//! - Durable priority queue for discovery work
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability

pub mod config;
pub mod db;
pub mod errors;
pub mod metrics;
pub mod queue;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::{DbPool, GraphStore, NewPaper, Repository};
pub use errors::{AppError, Result};
pub use queue::{EnqueueOutcome, FailureClass, FailureOutcome, PriorityQueue, QueueSettings};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
