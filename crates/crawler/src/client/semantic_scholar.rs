//! Semantic Scholar Graph API client

use super::{BibliographicClient, FetchError, FetchedPaper, PaperMetadata, PaperSummary};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use citegraph_common::config::BibliographicConfig;
use citegraph_common::errors::Result;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Process-wide token bucket in front of the API
pub type ApiRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const PAPER_FIELDS: &str = "paperId,title,year,abstract,citationCount,referenceCount,openAccessPdf";
const NEIGHBOR_FIELDS: &str = "paperId,title,year,citationCount";

/// Longest error body kept in a `ServerError`
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiPaper {
    paper_id: Option<String>,
    title: Option<String>,
    year: Option<i32>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    citation_count: Option<i64>,
    reference_count: Option<i64>,
    open_access_pdf: Option<ApiPdf>,
}

#[derive(Debug, Deserialize)]
struct ApiPdf {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    next: Option<u32>,
    data: Option<Vec<T>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReferenceItem {
    cited_paper: Option<ApiPaper>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CitationItem {
    citing_paper: Option<ApiPaper>,
}

impl ApiPaper {
    fn into_metadata(self, requested_id: &str) -> PaperMetadata {
        let paper_id = self
            .paper_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| requested_id.to_string());

        PaperMetadata {
            paper_id,
            title: self.title,
            year: self.year,
            abstract_text: self.abstract_text,
            citation_count: self.citation_count,
            reference_count: self.reference_count,
            pdf_url: self.open_access_pdf.and_then(|pdf| pdf.url),
        }
    }

    /// Neighbors without an identifier cannot be crawled and are dropped
    fn into_summary(self) -> Option<PaperSummary> {
        let paper_id = self.paper_id.filter(|id| !id.trim().is_empty())?;
        Some(PaperSummary {
            paper_id,
            title: self.title,
            year: self.year,
            citation_count: self.citation_count,
        })
    }
}

/// Semantic Scholar client with throttling and transport retries
pub struct SemanticScholarClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    limiter: Arc<ApiRateLimiter>,
    permits: Arc<Semaphore>,
    page_size: u32,
    max_neighbors: usize,
    max_elapsed: Duration,
}

impl SemanticScholarClient {
    /// Create a new client from configuration
    pub fn new(config: &BibliographicConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("citegraph-crawler/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let rate = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|key| !key.is_empty()),
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(rate))),
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            page_size: config.page_size.max(1),
            max_neighbors: config.max_neighbors,
            max_elapsed: Duration::from_secs(config.transport_retry_max_elapsed_secs),
        })
    }

    /// GET with in-process retries for transient failures only
    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> std::result::Result<T, FetchError> {
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(self.max_elapsed),
            ..ExponentialBackoff::default()
        };

        let op = move || async move {
            self.send_once::<T>(url, query).await.map_err(|e| match e {
                FetchError::ServerError { .. } | FetchError::Network(_) => {
                    backoff::Error::transient(e)
                }
                other => backoff::Error::permanent(other),
            })
        };

        backoff::future::retry_notify(policy, op, |err: FetchError, wait: Duration| {
            warn!(url, error = %err, wait_ms = wait.as_millis() as u64, "Transient API error, retrying");
        })
        .await
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> std::result::Result<T, FetchError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| FetchError::Network("request permits closed".to_string()))?;
        self.limiter.until_ready().await;

        let mut request = self.http.get(url).query(query);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited {
                retry_after: parse_retry_after(response.headers()),
            });
        }
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            truncate_body(&mut body);
            return Err(if status.is_server_error() {
                FetchError::ServerError {
                    status: status.as_u16(),
                    message: body,
                }
            } else {
                FetchError::InvalidResponse(format!("unexpected status {}: {}", status, body))
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        serde_json::from_slice(&bytes).map_err(|e| FetchError::InvalidResponse(e.to_string()))
    }

    /// Walk a paginated neighbor listing up to `max_neighbors`
    async fn neighbors<E, F>(
        &self,
        paper_id: &str,
        endpoint: &str,
        pick: F,
    ) -> std::result::Result<Vec<PaperSummary>, FetchError>
    where
        E: DeserializeOwned,
        F: Fn(E) -> Option<ApiPaper>,
    {
        let url = format!("{}/paper/{}/{}", self.base_url, paper_id, endpoint);
        let mut collected = Vec::new();
        let mut offset: u32 = 0;

        while collected.len() < self.max_neighbors {
            let remaining = self.max_neighbors - collected.len();
            let limit = remaining.min(self.page_size as usize);

            let page: Page<E> = self
                .get_json(
                    &url,
                    &[
                        ("fields", NEIGHBOR_FIELDS.to_string()),
                        ("offset", offset.to_string()),
                        ("limit", limit.to_string()),
                    ],
                )
                .await?;

            let data = page.data.unwrap_or_default();
            let received = data.len();
            collected.extend(data.into_iter().filter_map(&pick).filter_map(ApiPaper::into_summary));

            match page.next {
                Some(next) if received > 0 && next > offset => offset = next,
                _ => break,
            }
        }

        collected.truncate(self.max_neighbors);
        Ok(collected)
    }
}

#[async_trait]
impl BibliographicClient for SemanticScholarClient {
    async fn fetch(&self, paper_id: &str) -> std::result::Result<FetchedPaper, FetchError> {
        let url = format!("{}/paper/{}", self.base_url, paper_id);
        let paper: ApiPaper = self
            .get_json(&url, &[("fields", PAPER_FIELDS.to_string())])
            .await?;
        let metadata = paper.into_metadata(paper_id);

        let references = self
            .neighbors(&metadata.paper_id, "references", |item: ReferenceItem| item.cited_paper)
            .await?;
        let citations = self
            .neighbors(&metadata.paper_id, "citations", |item: CitationItem| item.citing_paper)
            .await?;

        debug!(
            paper_id = %metadata.paper_id,
            references = references.len(),
            citations = citations.len(),
            "Fetched paper"
        );

        Ok(FetchedPaper {
            metadata,
            references,
            citations,
        })
    }

    fn name(&self) -> &str {
        "semantic-scholar"
    }
}

/// `Retry-After` as delta-seconds or an HTTP date
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let wait = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}

fn truncate_body(body: &mut String) {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
}
