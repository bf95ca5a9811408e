//! Scripted client for tests and dry runs

use super::{BibliographicClient, FetchError, FetchedPaper, PaperMetadata, PaperSummary};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

type Reply = Result<FetchedPaper, FetchError>;

#[derive(Default)]
struct Script {
    queued: HashMap<String, VecDeque<Reply>>,
    fallback: HashMap<String, Reply>,
    calls: Vec<String>,
}

/// In-memory client answering from a per-identifier script.
///
/// Queued replies are consumed in order; once exhausted the fallback reply
/// for that identifier is repeated. Unknown identifiers answer `NotFound`.
#[derive(Default)]
pub struct ScriptedClient {
    script: Mutex<Script>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every fetch of `paper_id` with `reply`
    pub fn always(&self, paper_id: &str, reply: Reply) -> &Self {
        if let Ok(mut script) = self.script.lock() {
            script.fallback.insert(paper_id.to_string(), reply);
        }
        self
    }

    /// Answer the next unanswered fetch of `paper_id` with `reply`
    pub fn once(&self, paper_id: &str, reply: Reply) -> &Self {
        if let Ok(mut script) = self.script.lock() {
            script
                .queued
                .entry(paper_id.to_string())
                .or_default()
                .push_back(reply);
        }
        self
    }

    /// Identifiers fetched so far, in call order
    pub fn calls(&self) -> Vec<String> {
        self.script
            .lock()
            .map(|script| script.calls.clone())
            .unwrap_or_default()
    }

    /// Convenience builder for a successful fetch
    pub fn paper(
        paper_id: &str,
        year: Option<i32>,
        citation_count: Option<i64>,
        references: &[PaperSummary],
        citations: &[PaperSummary],
    ) -> FetchedPaper {
        FetchedPaper {
            metadata: PaperMetadata {
                paper_id: paper_id.to_string(),
                title: Some(format!("Paper {paper_id}")),
                year,
                citation_count,
                reference_count: Some(references.len() as i64),
                ..Default::default()
            },
            references: references.to_vec(),
            citations: citations.to_vec(),
        }
    }
}

#[async_trait]
impl BibliographicClient for ScriptedClient {
    async fn fetch(&self, paper_id: &str) -> Result<FetchedPaper, FetchError> {
        let mut script = self
            .script
            .lock()
            .map_err(|_| FetchError::Network("script lock poisoned".to_string()))?;

        script.calls.push(paper_id.to_string());

        if let Some(reply) = script.queued.get_mut(paper_id).and_then(VecDeque::pop_front) {
            return reply;
        }

        script
            .fallback
            .get(paper_id)
            .cloned()
            .unwrap_or(Err(FetchError::NotFound))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replies_in_order() {
        let client = ScriptedClient::new();
        let paper = ScriptedClient::paper("A", Some(2020), Some(1), &[], &[]);
        client
            .once("A", Err(FetchError::Network("reset".into())))
            .always("A", Ok(paper.clone()));

        assert!(client.fetch("A").await.is_err());
        assert_eq!(client.fetch("A").await.unwrap(), paper);
        assert_eq!(client.fetch("A").await.unwrap(), paper);
        assert_eq!(client.fetch("Z").await, Err(FetchError::NotFound));
        assert_eq!(client.calls(), vec!["A", "A", "A", "Z"]);
    }
}
