//! Crawler error types

use citegraph_common::errors::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrawlerError {
    /// Graph store or queue failure; never retried
    #[error("Store error: {0}")]
    Store(#[from] AppError),

    #[error("Worker error: {0}")]
    Worker(String),
}

impl CrawlerError {
    /// Invariant violation in the queue state machine
    pub fn is_fatal(&self) -> bool {
        matches!(self, CrawlerError::Store(e) if e.is_fatal())
    }

    /// The worker no longer holds the lease it was settling
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, CrawlerError::Store(e) if e.is_lease_lost())
    }
}

impl From<tokio::task::JoinError> for CrawlerError {
    fn from(e: tokio::task::JoinError) -> Self {
        CrawlerError::Worker(e.to_string())
    }
}
