//! CiteGraph Crawler
//!
//! Citation-graph discovery: a pool of workers pulls the most promising paper
//! from the durable queue, fetches it from the bibliographic API, stores it
//! with its citation edges and schedules unseen neighbors by weight.

pub mod client;
pub mod errors;
pub mod orchestrator;
pub mod weight;

pub use client::{BibliographicClient, FetchError, FetchedPaper, SemanticScholarClient};
pub use errors::CrawlerError;
pub use orchestrator::{DiscoveryOrchestrator, ProcessOutcome, RunSettings, RunSummary};
pub use weight::{PaperAttributes, WeightCalculator};
