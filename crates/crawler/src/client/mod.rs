//! Bibliographic API client abstraction
//!
//! One read per paper identifier returns the paper's metadata together with
//! its outgoing references and incoming citations.

mod mock;
mod semantic_scholar;

pub use mock::ScriptedClient;
pub use semantic_scholar::SemanticScholarClient;

use async_trait::async_trait;
use citegraph_common::db::NewPaper;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy of a single fetch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The API does not know this identifier; never retried
    #[error("Paper not found")]
    NotFound,

    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Server error {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    /// Payload could not be decoded; retrying returns the same bytes
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl FetchError {
    /// Whether a later attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::RateLimited { .. } | FetchError::ServerError { .. } | FetchError::Network(_)
        )
    }

    /// Server-supplied minimum delay before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Metric label
    pub fn outcome(&self) -> &'static str {
        match self {
            FetchError::NotFound => "not_found",
            FetchError::RateLimited { .. } => "rate_limited",
            FetchError::ServerError { .. } => "server_error",
            FetchError::Network(_) => "network_error",
            FetchError::InvalidResponse(_) => "invalid_response",
        }
    }
}

/// Full metadata of the fetched paper
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperMetadata {
    /// Canonical identifier as reported by the API
    pub paper_id: String,
    pub title: Option<String>,
    pub year: Option<i32>,
    pub abstract_text: Option<String>,
    pub citation_count: Option<i64>,
    pub reference_count: Option<i64>,
    pub pdf_url: Option<String>,
}

impl From<&PaperMetadata> for NewPaper {
    fn from(meta: &PaperMetadata) -> Self {
        NewPaper {
            paper_id: meta.paper_id.clone(),
            title: meta.title.clone(),
            year: meta.year,
            abstract_text: meta.abstract_text.clone(),
            citation_count: meta.citation_count,
            reference_count: meta.reference_count,
            pdf_url: meta.pdf_url.clone(),
        }
    }
}

/// What a reference or citation listing says about a neighbor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperSummary {
    pub paper_id: String,
    pub title: Option<String>,
    pub year: Option<i32>,
    pub citation_count: Option<i64>,
}

/// Result of one successful fetch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPaper {
    pub metadata: PaperMetadata,
    /// Papers this paper cites
    pub references: Vec<PaperSummary>,
    /// Papers that cite this paper
    pub citations: Vec<PaperSummary>,
}

/// Trait for bibliographic lookups
#[async_trait]
pub trait BibliographicClient: Send + Sync {
    /// Fetch metadata, references and citations of one paper
    async fn fetch(&self, paper_id: &str) -> Result<FetchedPaper, FetchError>;

    /// Provider name for logs
    fn name(&self) -> &str;
}
