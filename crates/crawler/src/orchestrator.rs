//! Discovery orchestrator
//!
//! Drives the worklist: dequeue the most urgent paper, fetch it, persist the
//! paper with its edges and newly discovered neighbors, then complete the
//! entry. Graph writes and the completion commit in one transaction; the
//! network call happens before the transaction opens.

use crate::client::{BibliographicClient, FetchError, FetchedPaper};
use crate::errors::CrawlerError;
use crate::weight::{PaperAttributes, WeightCalculator};
use citegraph_common::config::AppConfig;
use citegraph_common::db::models::{EdgeRelation, QueueEntry};
use citegraph_common::db::{DbPool, EdgeWrite, GraphStore, NewPaper, PaperWrite, Repository};
use citegraph_common::errors::AppError;
use citegraph_common::metrics;
use citegraph_common::queue::{
    EnqueueOutcome, FailureClass, FailureOutcome, PriorityQueue, QueueSettings,
};
use sea_orm::prelude::DateTimeWithTimeZone;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Reason stored for papers the API does not know
const NOT_FOUND_REASON: &str = "not found";

type Result<T> = std::result::Result<T, CrawlerError>;

/// Worker pool settings
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub workers: usize,
    pub poll_interval: Duration,
    pub reclaim_interval: Duration,
    pub stop_when_drained: bool,
}

impl RunSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            workers: config.crawler.workers.max(1),
            poll_interval: config.poll_interval(),
            reclaim_interval: config.reclaim_interval(),
            stop_when_drained: config.crawler.stop_when_drained,
        }
    }
}

/// What one discovery step did
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Nothing eligible to dequeue
    Idle,
    Completed {
        paper_id: String,
        /// Identifier the paper was stored under
        canonical_id: String,
        edges: u64,
        enqueued: u64,
    },
    /// The API has no such paper; recorded and completed
    Unavailable { paper_id: String },
    Rescheduled {
        paper_id: String,
        retry_count: u32,
        next_eligible_at: DateTimeWithTimeZone,
    },
    Failed { paper_id: String, retry_count: u32 },
}

/// Totals over one `run`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: u64,
    pub unavailable: u64,
    pub rescheduled: u64,
    pub failed: u64,
    /// Steps abandoned because the lease was reclaimed mid-flight
    pub lease_lost: u64,
    pub errors: u64,
}

impl RunSummary {
    fn record(&mut self, outcome: &ProcessOutcome) {
        match outcome {
            ProcessOutcome::Idle => {}
            ProcessOutcome::Completed { .. } => self.completed += 1,
            ProcessOutcome::Unavailable { .. } => self.unavailable += 1,
            ProcessOutcome::Rescheduled { .. } => self.rescheduled += 1,
            ProcessOutcome::Failed { .. } => self.failed += 1,
        }
    }

    fn merge(&mut self, other: RunSummary) {
        self.completed += other.completed;
        self.unavailable += other.unavailable;
        self.rescheduled += other.rescheduled;
        self.failed += other.failed;
        self.lease_lost += other.lease_lost;
        self.errors += other.errors;
    }
}

pub struct DiscoveryOrchestrator {
    repository: Repository,
    queue: PriorityQueue,
    client: Arc<dyn BibliographicClient>,
    weights: WeightCalculator,
    settings: RunSettings,
}

impl DiscoveryOrchestrator {
    pub fn new(
        repository: Repository,
        queue: PriorityQueue,
        client: Arc<dyn BibliographicClient>,
        weights: WeightCalculator,
        settings: RunSettings,
    ) -> Self {
        Self {
            repository,
            queue,
            client,
            weights,
            settings,
        }
    }

    /// Wire every component from configuration
    pub fn from_config(pool: DbPool, client: Arc<dyn BibliographicClient>, config: &AppConfig) -> Self {
        Self::new(
            Repository::new(pool.clone()),
            PriorityQueue::new(pool, QueueSettings::from_config(&config.queue)),
            client,
            WeightCalculator::new(&config.weight),
            RunSettings::from_config(config),
        )
    }

    pub fn queue(&self) -> &PriorityQueue {
        &self.queue
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Enqueue user-supplied seeds at distance zero
    pub async fn seed(&self, paper_ids: &[String]) -> Result<Vec<(String, EnqueueOutcome)>> {
        let priority = self.weights.seed_priority();
        let mut outcomes = Vec::with_capacity(paper_ids.len());

        for paper_id in paper_ids {
            let paper_id = paper_id.trim();
            let outcome = self.queue.enqueue(paper_id, priority, 0).await?;
            info!(paper_id, ?outcome, "Seed submitted");
            outcomes.push((paper_id.to_string(), outcome));
        }

        Ok(outcomes)
    }

    /// Run one discovery step for `worker_id`
    #[instrument(skip(self))]
    pub async fn process_next(&self, worker_id: &str) -> Result<ProcessOutcome> {
        match self.queue.dequeue_highest_priority(worker_id).await? {
            Some(entry) => self.process_entry(worker_id, entry).await,
            None => Ok(ProcessOutcome::Idle),
        }
    }

    /// Fetch and settle an entry `worker_id` holds the lease on. If the lease
    /// was reclaimed meanwhile, nothing is written and `LeaseLost` is returned.
    #[instrument(skip(self, entry), fields(paper_id = %entry.paper_id, retry_count = entry.retry_count))]
    pub async fn process_entry(&self, worker_id: &str, entry: QueueEntry) -> Result<ProcessOutcome> {
        let started = Instant::now();
        let fetched = self.client.fetch(&entry.paper_id).await;
        let outcome = match &fetched {
            Ok(_) => "success",
            Err(e) => e.outcome(),
        };
        metrics::record_fetch(started.elapsed().as_secs_f64(), outcome);

        match fetched {
            Ok(paper) => self.persist(worker_id, &entry, paper).await,
            Err(FetchError::NotFound) => self.settle_unavailable(worker_id, &entry).await,
            Err(e) => self.settle_failure(worker_id, &entry, e).await,
        }
    }

    /// Store the paper, its edges and unseen neighbors, then complete the
    /// entry, all in one transaction.
    async fn persist(&self, worker_id: &str, entry: &QueueEntry, fetched: FetchedPaper) -> Result<ProcessOutcome> {
        let distance = u32::try_from(entry.distance).unwrap_or(0);
        let next_distance = distance.saturating_add(1);
        let canonical_id = fetched.metadata.paper_id.clone();

        if canonical_id != entry.paper_id {
            debug!(requested = %entry.paper_id, canonical = %canonical_id, "API returned canonical identifier");
        }

        let txn = self.repository.pool().begin().await?;
        let graph = GraphStore::new(&txn);

        let written = graph.upsert_paper(&NewPaper::from(&fetched.metadata)).await?;

        let mut edges = 0u64;
        let mut enqueued = 0u64;
        let listings = [
            (&fetched.references, EdgeRelation::Cites),
            (&fetched.citations, EdgeRelation::CitedBy),
        ];

        for (neighbors, relation) in listings {
            for neighbor in neighbors {
                if graph.upsert_edge(&canonical_id, &neighbor.paper_id, relation).await? == EdgeWrite::Inserted {
                    edges += 1;
                }

                if neighbor.paper_id == canonical_id || neighbor.paper_id == entry.paper_id {
                    continue;
                }
                if graph.paper_exists(&neighbor.paper_id).await? {
                    continue;
                }

                let priority = self.weights.score(&PaperAttributes::from(neighbor), next_distance);
                let outcome = self
                    .queue
                    .enqueue_in(&txn, &neighbor.paper_id, priority, next_distance)
                    .await?;
                if outcome == EnqueueOutcome::Enqueued {
                    enqueued += 1;
                }
            }
        }

        self.queue.mark_completed_in(&txn, &entry.paper_id, worker_id).await?;
        txn.commit().await.map_err(AppError::from)?;

        let created = u64::from(written == PaperWrite::Created);
        metrics::record_discovery(created, edges, enqueued);
        info!(
            paper_id = %entry.paper_id,
            canonical_id = %canonical_id,
            distance,
            edges,
            enqueued,
            "Paper processed"
        );

        Ok(ProcessOutcome::Completed {
            paper_id: entry.paper_id.clone(),
            canonical_id,
            edges,
            enqueued,
        })
    }

    async fn settle_unavailable(&self, worker_id: &str, entry: &QueueEntry) -> Result<ProcessOutcome> {
        let txn = self.repository.pool().begin().await?;
        GraphStore::new(&txn)
            .mark_unavailable(&entry.paper_id, NOT_FOUND_REASON)
            .await?;
        self.queue.mark_completed_in(&txn, &entry.paper_id, worker_id).await?;
        txn.commit().await.map_err(AppError::from)?;

        info!(paper_id = %entry.paper_id, "Paper unavailable, recorded and completed");
        Ok(ProcessOutcome::Unavailable {
            paper_id: entry.paper_id.clone(),
        })
    }

    async fn settle_failure(&self, worker_id: &str, entry: &QueueEntry, error: FetchError) -> Result<ProcessOutcome> {
        let class = if error.is_retryable() {
            FailureClass::Retryable {
                retry_after: error.retry_after(),
            }
        } else {
            FailureClass::Permanent
        };

        let outcome = self
            .queue
            .mark_failed(&entry.paper_id, worker_id, &error.to_string(), class)
            .await?;

        Ok(match outcome {
            FailureOutcome::Rescheduled {
                retry_count,
                next_eligible_at,
            } => ProcessOutcome::Rescheduled {
                paper_id: entry.paper_id.clone(),
                retry_count,
                next_eligible_at,
            },
            FailureOutcome::Exhausted { retry_count } => ProcessOutcome::Failed {
                paper_id: entry.paper_id.clone(),
                retry_count,
            },
        })
    }

    /// Run the worker pool until drained (when configured) or halted.
    ///
    /// A halt stops new dequeues; in-flight steps finish. An invariant
    /// violation in any worker aborts the pool and is returned.
    pub async fn run(self: Arc<Self>, halt: watch::Receiver<bool>) -> Result<RunSummary> {
        let reclaimed = self.queue.reclaim_expired_leases().await?;
        info!(
            workers = self.settings.workers,
            requeued = reclaimed.requeued,
            exhausted = reclaimed.exhausted,
            client = self.client.name(),
            "Starting discovery workers"
        );

        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let mut workers = JoinSet::new();
        for n in 0..self.settings.workers {
            let this = Arc::clone(&self);
            let halt = halt.clone();
            let worker_id = format!("{}-{}", &run_id[..8], n);
            workers.spawn(async move { this.worker_loop(worker_id, halt).await });
        }

        let sweeper = {
            let this = Arc::clone(&self);
            let halt = halt.clone();
            tokio::spawn(async move { this.sweep_leases(halt).await })
        };

        let mut summary = RunSummary::default();
        let mut fatal: Option<CrawlerError> = None;

        while let Some(joined) = workers.join_next().await {
            match joined.map_err(CrawlerError::from) {
                Ok(Ok(stats)) => summary.merge(stats),
                Ok(Err(e)) | Err(e) => {
                    error!(error = %e, "Worker stopped with error");
                    if fatal.is_none() {
                        workers.abort_all();
                        fatal = Some(e);
                    }
                }
            }
        }

        sweeper.abort();

        if let Some(e) = fatal {
            return Err(e);
        }

        info!(
            completed = summary.completed,
            unavailable = summary.unavailable,
            rescheduled = summary.rescheduled,
            failed = summary.failed,
            lease_lost = summary.lease_lost,
            errors = summary.errors,
            "Discovery workers stopped"
        );
        Ok(summary)
    }

    async fn worker_loop(&self, worker_id: String, mut halt: watch::Receiver<bool>) -> Result<RunSummary> {
        let mut stats = RunSummary::default();
        debug!(worker_id, "Worker started");

        loop {
            if *halt.borrow() {
                info!(worker_id, "Halt requested, worker stopping");
                break;
            }

            match self.process_next(&worker_id).await {
                Ok(ProcessOutcome::Idle) => {
                    if self.settings.stop_when_drained {
                        match self.queue.has_outstanding_work().await {
                            Ok(false) => {
                                info!(worker_id, "Queue drained, worker stopping");
                                break;
                            }
                            Ok(true) => {}
                            Err(e) if e.is_fatal() => return Err(e.into()),
                            Err(e) => {
                                error!(worker_id, error = %e, "Drain check failed");
                                stats.errors += 1;
                            }
                        }
                    }
                    self.pause(&mut halt).await;
                }
                Ok(outcome) => stats.record(&outcome),
                Err(e) if e.is_fatal() => {
                    error!(worker_id, error = %e, "Queue invariant violated");
                    return Err(e);
                }
                Err(e) if e.is_lease_lost() => {
                    // Another worker owns the entry now; our writes were rolled back
                    warn!(worker_id, error = %e, "Lease lost, step discarded");
                    stats.lease_lost += 1;
                }
                Err(e) => {
                    // The entry stays leased and comes back through reclaim
                    error!(worker_id, error = %e, "Discovery step failed");
                    stats.errors += 1;
                    self.pause(&mut halt).await;
                }
            }
        }

        Ok(stats)
    }

    /// Sleep one poll interval, waking early on halt
    async fn pause(&self, halt: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.poll_interval) => {}
            Ok(()) = halt.changed() => {}
        }
    }

    async fn sweep_leases(&self, mut halt: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.reclaim_interval);
        // First tick fires immediately and startup already swept
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.queue.reclaim_expired_leases().await {
                        warn!(error = %e, "Lease sweep failed");
                    }
                }
                Ok(()) = halt.changed() => {
                    if *halt.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{PaperSummary, ScriptedClient};
    use citegraph_common::config::WeightConfig;
    use citegraph_common::db::models::QueueStatus;
    use citegraph_common::queue::BackoffPolicy;
    use sea_orm::ConnectionTrait;

    struct Harness {
        orchestrator: Arc<DiscoveryOrchestrator>,
        client: Arc<ScriptedClient>,
    }

    impl Harness {
        fn queue(&self) -> &PriorityQueue {
            self.orchestrator.queue()
        }

        fn repo(&self) -> &Repository {
            self.orchestrator.repository()
        }

        async fn status(&self, paper_id: &str) -> Option<QueueStatus> {
            self.queue().get(paper_id).await.unwrap().and_then(|e| e.queue_status())
        }
    }

    async fn harness(max_retries: u32) -> Harness {
        let pool = DbPool::in_memory().await.unwrap();
        let client = Arc::new(ScriptedClient::new());
        let settings = QueueSettings {
            max_retries,
            lease: Duration::from_secs(60),
            backoff: BackoffPolicy {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(5),
                multiplier: 2.0,
                jitter: 0.0,
                max_hint: Duration::from_secs(60),
            },
        };
        let orchestrator = DiscoveryOrchestrator::new(
            Repository::new(pool.clone()),
            PriorityQueue::new(pool, settings),
            client.clone(),
            WeightCalculator::with_reference_year(&WeightConfig::default(), 2025),
            RunSettings {
                workers: 2,
                poll_interval: Duration::from_millis(10),
                reclaim_interval: Duration::from_secs(60),
                stop_when_drained: true,
            },
        );
        Harness {
            orchestrator: Arc::new(orchestrator),
            client,
        }
    }

    fn neighbor(id: &str, year: i32, citations: i64) -> PaperSummary {
        PaperSummary {
            paper_id: id.to_string(),
            title: None,
            year: Some(year),
            citation_count: Some(citations),
        }
    }

    fn seeds(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_seed_then_neighbor_enqueued_with_lower_score() {
        let h = harness(3).await;
        h.client.always(
            "A",
            Ok(ScriptedClient::paper("A", Some(2020), Some(100), &[neighbor("B", 2015, 10)], &[])),
        );

        tokio_test::assert_ok!(h.orchestrator.seed(&seeds(&["A"])).await);
        let outcome = h.orchestrator.process_next("w1").await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Completed { enqueued: 1, edges: 1, .. }));

        assert!(h.repo().graph().paper_exists("A").await.unwrap());
        assert!(!h.repo().graph().paper_exists("B").await.unwrap());

        let a = h.queue().get("A").await.unwrap().unwrap();
        let b = h.queue().get("B").await.unwrap().unwrap();
        assert_eq!(a.queue_status(), Some(QueueStatus::Completed));
        assert_eq!(b.queue_status(), Some(QueueStatus::Pending));
        assert_eq!(b.distance, 1);
        assert!(b.priority < a.priority);

        let edges = h.repo().graph().edges_from("A").await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target_id, "B");
        assert_eq!(edges[0].edge_relation(), Some(EdgeRelation::Cites));
    }

    #[tokio::test]
    async fn test_citations_recorded_as_cited_by() {
        let h = harness(3).await;
        h.client.always(
            "A",
            Ok(ScriptedClient::paper("A", Some(2020), Some(5), &[], &[neighbor("Z", 2023, 1)])),
        );

        h.orchestrator.seed(&seeds(&["A"])).await.unwrap();
        h.orchestrator.process_next("w1").await.unwrap();

        let edges = h.repo().graph().edges_from("A").await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].edge_relation(), Some(EdgeRelation::CitedBy));
        assert_eq!(h.status("Z").await, Some(QueueStatus::Pending));
    }

    #[tokio::test]
    async fn test_mutual_citations_fetch_each_paper_once() {
        let h = harness(3).await;
        h.client
            .always("A", Ok(ScriptedClient::paper("A", Some(2020), Some(3), &[neighbor("B", 2019, 1)], &[neighbor("B", 2019, 1)])))
            .always("B", Ok(ScriptedClient::paper("B", Some(2019), Some(1), &[neighbor("A", 2020, 3)], &[neighbor("A", 2020, 3)])));

        h.orchestrator.seed(&seeds(&["A", "A"])).await.unwrap();
        let summary = h.orchestrator.clone().run(watch::channel(false).1).await.unwrap();

        assert_eq!(summary.completed, 2);
        assert_eq!(h.client.calls(), vec!["A", "B"]);
        assert_eq!(h.repo().paper_count().await.unwrap(), 2);
        assert_eq!(h.queue().counts().await.unwrap().total(), 2);
        assert_eq!(h.repo().edge_count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_stale_worker_cannot_complete_twice() {
        let h = harness(3).await;
        h.client.always(
            "A",
            Ok(ScriptedClient::paper("A", Some(2020), Some(3), &[neighbor("B", 2019, 1)], &[])),
        );
        h.orchestrator.seed(&seeds(&["A"])).await.unwrap();

        let entry = h.queue().dequeue_highest_priority("w1").await.unwrap().unwrap();
        h.orchestrator.process_entry("w1", entry.clone()).await.unwrap();

        // Replaying the same lease must roll back and surface the violation
        let err = h.orchestrator.process_entry("w1", entry).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(h.repo().paper_count().await.unwrap(), 1);
        assert_eq!(h.queue().counts().await.unwrap().total(), 2);
    }

    #[tokio::test]
    async fn test_reclaimed_lease_holder_is_fenced_out() {
        let h = harness(3).await;
        h.client.always(
            "A",
            Ok(ScriptedClient::paper("A", Some(2020), Some(3), &[neighbor("B", 2019, 1)], &[])),
        );
        h.orchestrator.seed(&seeds(&["A"])).await.unwrap();

        let start = chrono::Utc::now();
        let stale = h.queue().dequeue_at("w1", start).await.unwrap().unwrap();
        h.queue()
            .reclaim_expired_at(start + chrono::Duration::seconds(61))
            .await
            .unwrap();
        let current = h
            .queue()
            .dequeue_at("w2", start + chrono::Duration::seconds(62))
            .await
            .unwrap()
            .unwrap();

        // The stale worker's whole transaction rolls back
        let err = h.orchestrator.process_entry("w1", stale).await.unwrap_err();
        assert!(err.is_lease_lost());
        assert!(!err.is_fatal());
        assert_eq!(h.repo().paper_count().await.unwrap(), 0);
        assert_eq!(h.repo().edge_count().await.unwrap(), 0);
        assert!(h.queue().get("B").await.unwrap().is_none());
        assert_eq!(h.status("A").await, Some(QueueStatus::Processing));

        let outcome = h.orchestrator.process_entry("w2", current).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Completed { enqueued: 1, .. }));
        assert_eq!(h.status("A").await, Some(QueueStatus::Completed));
    }

    #[tokio::test]
    async fn test_reclaimed_lease_holder_cannot_record_failure() {
        let h = harness(3).await;
        h.client.always("A", Err(FetchError::Network("reset".into())));
        h.orchestrator.seed(&seeds(&["A"])).await.unwrap();

        let start = chrono::Utc::now();
        let stale = h.queue().dequeue_at("w1", start).await.unwrap().unwrap();
        h.queue()
            .reclaim_expired_at(start + chrono::Duration::seconds(61))
            .await
            .unwrap();
        h.queue()
            .dequeue_at("w2", start + chrono::Duration::seconds(62))
            .await
            .unwrap()
            .unwrap();

        let err = h.orchestrator.process_entry("w1", stale).await.unwrap_err();
        assert!(err.is_lease_lost());
        let entry = h.queue().get("A").await.unwrap().unwrap();
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.leased_by.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_not_found_is_recorded_and_completed() {
        let h = harness(3).await;
        h.orchestrator.seed(&seeds(&["X"])).await.unwrap();

        let outcome = h.orchestrator.process_next("w1").await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Unavailable { paper_id: "X".into() });
        assert!(h.repo().graph().is_unavailable("X").await.unwrap());
        assert!(!h.repo().graph().paper_exists("X").await.unwrap());
        assert_eq!(h.status("X").await, Some(QueueStatus::Completed));

        assert_eq!(h.orchestrator.process_next("w1").await.unwrap(), ProcessOutcome::Idle);
        assert_eq!(h.client.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_entry_is_deferred() {
        let h = harness(3).await;
        h.client.once(
            "C",
            Err(FetchError::RateLimited { retry_after: Some(Duration::from_secs(30)) }),
        );
        h.orchestrator.seed(&seeds(&["C"])).await.unwrap();

        let before = chrono::Utc::now();
        let outcome = h.orchestrator.process_next("w1").await.unwrap();
        match outcome {
            ProcessOutcome::Rescheduled { retry_count, next_eligible_at, .. } => {
                assert_eq!(retry_count, 1);
                assert!(next_eligible_at >= before + chrono::Duration::seconds(29));
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        assert_eq!(h.status("C").await, Some(QueueStatus::Pending));
        assert_eq!(h.orchestrator.process_next("w1").await.unwrap(), ProcessOutcome::Idle);
        assert_eq!(h.client.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_server_errors_end_in_terminal_failure() {
        let max_retries = 2;
        let h = harness(max_retries).await;
        h.client.always(
            "D",
            Err(FetchError::ServerError { status: 503, message: "unavailable".into() }),
        );
        h.orchestrator.seed(&seeds(&["D"])).await.unwrap();

        let summary = h.orchestrator.clone().run(watch::channel(false).1).await.unwrap();

        assert_eq!(summary.rescheduled, max_retries as u64);
        assert_eq!(summary.failed, 1);
        assert_eq!(h.client.calls().len(), max_retries as usize + 1);

        let entry = h.queue().get("D").await.unwrap().unwrap();
        assert_eq!(entry.queue_status(), Some(QueueStatus::Failed));
        assert_eq!(entry.retry_count, max_retries as i32 + 1);
        assert!(entry.last_error.unwrap_or_default().contains("503"));
    }

    #[tokio::test]
    async fn test_invalid_response_fails_without_retry() {
        let h = harness(5).await;
        h.client.always("E", Err(FetchError::InvalidResponse("truncated json".into())));
        h.orchestrator.seed(&seeds(&["E"])).await.unwrap();

        let outcome = h.orchestrator.process_next("w1").await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Failed { paper_id: "E".into(), retry_count: 1 });
        assert_eq!(h.status("E").await, Some(QueueStatus::Failed));
    }

    #[tokio::test]
    async fn test_known_neighbor_gets_edge_but_no_entry() {
        let h = harness(3).await;
        h.repo()
            .graph()
            .upsert_paper(&NewPaper { paper_id: "B".into(), ..Default::default() })
            .await
            .unwrap();
        h.client.always(
            "A",
            Ok(ScriptedClient::paper("A", Some(2020), Some(3), &[neighbor("B", 2019, 1), neighbor("A", 2020, 3)], &[])),
        );
        h.orchestrator.seed(&seeds(&["A"])).await.unwrap();

        let outcome = h.orchestrator.process_next("w1").await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Completed { edges: 1, enqueued: 0, .. }));
        assert!(h.queue().get("B").await.unwrap().is_none());
        assert_eq!(h.repo().graph().edges_from("A").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_canonical_identifier_used_for_graph() {
        let h = harness(3).await;
        h.client.always(
            "DOI:10.1000/xyz",
            Ok(ScriptedClient::paper("S2-1", Some(2021), Some(8), &[neighbor("B", 2019, 1)], &[])),
        );
        h.orchestrator.seed(&seeds(&["DOI:10.1000/xyz"])).await.unwrap();

        let outcome = h.orchestrator.process_next("w1").await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Completed { ref canonical_id, .. } if canonical_id == "S2-1"));

        assert!(h.repo().graph().paper_exists("S2-1").await.unwrap());
        assert_eq!(h.repo().graph().edges_from("S2-1").await.unwrap().len(), 1);
        assert_eq!(h.status("DOI:10.1000/xyz").await, Some(QueueStatus::Completed));
        assert_eq!(h.status("B").await, Some(QueueStatus::Pending));
    }

    #[tokio::test]
    async fn test_run_drains_multi_hop_graph() {
        let h = harness(3).await;
        h.client
            .always("A", Ok(ScriptedClient::paper("A", Some(2020), Some(100), &[neighbor("B", 2015, 10), neighbor("C", 2018, 4)], &[])))
            .always("B", Ok(ScriptedClient::paper("B", Some(2015), Some(10), &[neighbor("D", 2001, 50)], &[])))
            .always("C", Ok(ScriptedClient::paper("C", Some(2018), Some(4), &[], &[])));
        // D is unknown to the API

        h.orchestrator.seed(&seeds(&["A"])).await.unwrap();
        let summary = h.orchestrator.clone().run(watch::channel(false).1).await.unwrap();

        assert_eq!(summary.completed, 3);
        assert_eq!(summary.unavailable, 1);
        let counts = h.queue().counts().await.unwrap();
        assert_eq!(counts.completed, 4);
        assert!(!h.queue().has_outstanding_work().await.unwrap());
        assert_eq!(h.queue().get("D").await.unwrap().unwrap().distance, 2);
    }

    #[tokio::test]
    async fn test_storage_outage_does_not_abort_run() {
        let h = harness(3).await;
        h.client.always("A", Ok(ScriptedClient::paper("A", Some(2020), Some(1), &[], &[])));
        h.orchestrator.seed(&seeds(&["A"])).await.unwrap();

        // Park A behind a short backoff so workers sit idle polling the queue
        h.queue().dequeue_highest_priority("w0").await.unwrap().unwrap();
        h.queue()
            .mark_failed(
                "A",
                "w0",
                "rate limited",
                FailureClass::Retryable { retry_after: Some(Duration::from_millis(500)) },
            )
            .await
            .unwrap();

        let handle = tokio::spawn(h.orchestrator.clone().run(watch::channel(false).1));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let conn = h.repo().pool().connection();
        conn.execute_unprepared("ALTER TABLE discovery_queue RENAME TO discovery_queue_parked")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        conn.execute_unprepared("ALTER TABLE discovery_queue_parked RENAME TO discovery_queue")
            .await
            .unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(summary.errors > 0);
        assert_eq!(summary.completed, 1);
        assert_eq!(h.status("A").await, Some(QueueStatus::Completed));
    }

    #[tokio::test]
    async fn test_run_stops_on_halt() {
        let pool = DbPool::in_memory().await.unwrap();
        let orchestrator = Arc::new(DiscoveryOrchestrator::new(
            Repository::new(pool.clone()),
            PriorityQueue::new(pool, QueueSettings::from_config(&Default::default())),
            Arc::new(ScriptedClient::new()),
            WeightCalculator::new(&WeightConfig::default()),
            RunSettings {
                workers: 3,
                poll_interval: Duration::from_secs(30),
                reclaim_interval: Duration::from_secs(60),
                stop_when_drained: false,
            },
        ));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(orchestrator.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary, RunSummary::default());
    }
}
