//! Durable priority queue for discovery work
//!
//! One row per paper identifier in `discovery_queue`. All state changes are
//! conditional updates keyed on the current status, so concurrent workers
//! (and crashed ones) cannot claim or finish the same entry twice:
//!
//! ```text
//! pending --dequeue--> processing --mark_completed--> completed
//!    ^                     |
//!    +---- mark_failed ----+ (budget left)
//!                          +---- mark_failed --> failed (budget spent / permanent)
//! ```
//!
//! Retry delays are stored as `next_eligible_at` instead of being slept on,
//! which lets lease reclaim and backoff compose after a restart.

use crate::config::QueueConfig;
use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::{AppError, Result};
use crate::metrics;
use chrono::{DateTime, Utc};
use rand::Rng;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, UpdateMany,
};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Claim attempts before a dequeue call gives up under contention
const MAX_DEQUEUE_ATTEMPTS: usize = 8;

/// Error text recorded when a lease runs out
pub const LEASE_EXPIRED: &str = "lease expired";

/// Exponential retry delay with jitter
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay that may be randomized away, in `[0, 1]`
    pub jitter: f64,
    /// Ceiling on a server-supplied hint
    pub max_hint: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.backoff_initial_ms),
            max: Duration::from_millis(config.backoff_max_ms),
            multiplier: config.backoff_multiplier,
            jitter: config.backoff_jitter.clamp(0.0, 1.0),
            max_hint: Duration::from_secs(config.max_retry_after_secs),
        }
    }

    /// Delay before retry number `retry` (1-based). A server-supplied hint is
    /// a lower bound and is honored above `max`, up to `max_hint`.
    pub fn delay(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let exponent = retry.saturating_sub(1).min(1_000) as i32;
        let raw = self.initial.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=1.0);
            capped * factor
        } else {
            capped
        };

        let delay = Duration::from_secs_f64(jittered.max(0.0));
        match hint.map(|hint| hint.min(self.max_hint)) {
            Some(hint) if hint > delay => hint,
            _ => delay,
        }
    }
}

/// Queue behavior knobs
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_retries: u32,
    pub lease: Duration,
    pub backoff: BackoffPolicy,
}

impl QueueSettings {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            lease: Duration::from_secs(config.lease_secs),
            backoff: BackoffPolicy::from_config(config),
        }
    }
}

/// Result of an enqueue call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// An entry for this paper already exists, in any state
    AlreadyKnown,
}

/// How a failed attempt should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Transient; reschedule after backoff, honoring an optional server hint
    Retryable { retry_after: Option<Duration> },
    /// Retrying cannot help; fail terminally right away
    Permanent,
}

/// Where a failed entry ended up
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    Rescheduled {
        retry_count: u32,
        next_eligible_at: DateTimeWithTimeZone,
    },
    /// Terminal `failed`; requires operator action to run again
    Exhausted { retry_count: u32 },
}

/// Result of one lease sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimSummary {
    pub requeued: u64,
    pub exhausted: u64,
}

/// Entry count per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Durable, crash-safe priority queue
#[derive(Clone)]
pub struct PriorityQueue {
    pool: DbPool,
    settings: QueueSettings,
}

/// `now + duration`, saturating at the latest representable instant
fn add_delay(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn distance_column(distance: u32) -> i32 {
    i32::try_from(distance).unwrap_or(i32::MAX)
}

impl PriorityQueue {
    pub fn new(pool: DbPool, settings: QueueSettings) -> Self {
        Self { pool, settings }
    }

    /// Insert a pending entry unless the paper is already known
    pub async fn enqueue(
        &self,
        paper_id: &str,
        priority: f64,
        distance: u32,
    ) -> Result<EnqueueOutcome> {
        self.enqueue_in(self.pool.connection(), paper_id, priority, distance)
            .await
    }

    /// `enqueue` on a caller-supplied connection or transaction
    pub async fn enqueue_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        paper_id: &str,
        priority: f64,
        distance: u32,
    ) -> Result<EnqueueOutcome> {
        if paper_id.trim().is_empty() {
            return Err(AppError::InvalidIdentifier {
                id: paper_id.to_string(),
            });
        }
        if !priority.is_finite() {
            return Err(AppError::Validation {
                message: format!("priority for {paper_id} is not finite: {priority}"),
                field: Some("priority".to_string()),
            });
        }

        let now: DateTimeWithTimeZone = Utc::now().into();
        let model = QueueEntryActiveModel {
            paper_id: Set(paper_id.to_string()),
            priority: Set(priority),
            distance: Set(distance_column(distance)),
            status: Set(QueueStatus::Pending.as_str().to_string()),
            retry_count: Set(0),
            last_error: Set(None),
            next_eligible_at: Set(now),
            lease_expires_at: Set(None),
            leased_by: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            completed_at: Set(None),
            ..Default::default()
        };

        let inserted = QueueEntryEntity::insert(model)
            .on_conflict(
                OnConflict::column(QueueEntryColumn::PaperId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(conn)
            .await?;

        if inserted > 0 {
            debug!(paper_id, priority, distance, "Entry enqueued");
            metrics::record_transition(QueueStatus::Pending);
            Ok(EnqueueOutcome::Enqueued)
        } else {
            debug!(paper_id, "Entry already known");
            Ok(EnqueueOutcome::AlreadyKnown)
        }
    }

    /// Claim the most urgent eligible pending entry
    pub async fn dequeue_highest_priority(&self, worker_id: &str) -> Result<Option<QueueEntry>> {
        self.dequeue_at(worker_id, Utc::now()).await
    }

    /// Claim the most urgent entry eligible at `now`.
    ///
    /// The claim is a compare-and-swap on `status = 'pending'`; a caller that
    /// loses the race picks the next candidate.
    #[instrument(skip(self))]
    pub async fn dequeue_at(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueEntry>> {
        let conn = self.pool.connection();
        let now_tz: DateTimeWithTimeZone = now.into();
        let lease_until: DateTimeWithTimeZone = add_delay(now, self.settings.lease).into();

        for attempt in 0..MAX_DEQUEUE_ATTEMPTS {
            let candidate = QueueEntryEntity::find()
                .filter(QueueEntryColumn::Status.eq(QueueStatus::Pending.as_str()))
                .filter(QueueEntryColumn::NextEligibleAt.lte(now_tz))
                .order_by_desc(QueueEntryColumn::Priority)
                .order_by_asc(QueueEntryColumn::Id)
                .one(conn)
                .await?;

            let Some(mut entry) = candidate else {
                return Ok(None);
            };

            let claimed = QueueEntryEntity::update_many()
                .col_expr(QueueEntryColumn::Status, Expr::value(QueueStatus::Processing.as_str()))
                .col_expr(QueueEntryColumn::LeaseExpiresAt, Expr::value(Some(lease_until)))
                .col_expr(QueueEntryColumn::LeasedBy, Expr::value(Some(worker_id.to_string())))
                .col_expr(QueueEntryColumn::UpdatedAt, Expr::value(now_tz))
                .filter(QueueEntryColumn::Id.eq(entry.id))
                .filter(QueueEntryColumn::Status.eq(QueueStatus::Pending.as_str()))
                .exec(conn)
                .await?;

            if claimed.rows_affected == 1 {
                entry.status = QueueStatus::Processing.as_str().to_string();
                entry.lease_expires_at = Some(lease_until);
                entry.leased_by = Some(worker_id.to_string());
                entry.updated_at = now_tz;

                debug!(paper_id = %entry.paper_id, priority = entry.priority, "Entry claimed");
                metrics::record_transition(QueueStatus::Processing);
                return Ok(Some(entry));
            }

            debug!(paper_id = %entry.paper_id, attempt, "Lost claim race, retrying");
        }

        warn!("Dequeue gave up after repeated claim races");
        Ok(None)
    }

    /// `processing -> completed`, only for the worker holding the lease
    pub async fn mark_completed(&self, paper_id: &str, worker_id: &str) -> Result<()> {
        self.mark_completed_in(self.pool.connection(), paper_id, worker_id).await
    }

    /// `mark_completed` on a caller-supplied connection or transaction
    pub async fn mark_completed_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        paper_id: &str,
        worker_id: &str,
    ) -> Result<()> {
        let now: DateTimeWithTimeZone = Utc::now().into();

        let result = QueueEntryEntity::update_many()
            .col_expr(QueueEntryColumn::Status, Expr::value(QueueStatus::Completed.as_str()))
            .col_expr(QueueEntryColumn::CompletedAt, Expr::value(Some(now)))
            .col_expr(QueueEntryColumn::LeaseExpiresAt, Expr::value(Option::<DateTimeWithTimeZone>::None))
            .col_expr(QueueEntryColumn::UpdatedAt, Expr::value(now))
            .filter(QueueEntryColumn::PaperId.eq(paper_id))
            .filter(QueueEntryColumn::Status.eq(QueueStatus::Processing.as_str()))
            .filter(QueueEntryColumn::LeasedBy.eq(worker_id))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(lease_error(conn, paper_id, worker_id, QueueStatus::Completed).await);
        }

        metrics::record_transition(QueueStatus::Completed);
        Ok(())
    }

    /// `processing -> pending` while retry budget remains, otherwise
    /// `processing -> failed`. Permanent failures skip straight to `failed`.
    /// Only the worker holding the lease may report a failure.
    #[instrument(skip(self, error))]
    pub async fn mark_failed(
        &self,
        paper_id: &str,
        worker_id: &str,
        error: &str,
        class: FailureClass,
    ) -> Result<FailureOutcome> {
        let conn = self.pool.connection();

        let entry = self
            .get(paper_id)
            .await?
            .ok_or_else(|| AppError::EntryNotFound {
                paper_id: paper_id.to_string(),
            })?;

        if entry.leased_by.as_deref() != Some(worker_id) {
            return Err(AppError::LeaseLost {
                paper_id: paper_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        }

        if entry.queue_status() != Some(QueueStatus::Processing) {
            return Err(AppError::InvalidTransition {
                paper_id: paper_id.to_string(),
                from: entry.status,
                to: QueueStatus::Failed.as_str().to_string(),
            });
        }

        let (update, outcome) = self.failure_update(&entry, error, class, Utc::now());
        let result = update
            .filter(QueueEntryColumn::LeasedBy.eq(worker_id))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(lease_error(conn, paper_id, worker_id, QueueStatus::Failed).await);
        }

        self.log_failure(&entry.paper_id, error, &outcome);
        Ok(outcome)
    }

    /// Return abandoned `processing` entries to the queue
    pub async fn reclaim_expired_leases(&self) -> Result<ReclaimSummary> {
        self.reclaim_expired_at(Utc::now()).await
    }

    /// Reclaim every entry whose lease ended before `now`. A reclaim counts as
    /// a failed attempt, so a paper that keeps killing workers eventually
    /// becomes terminally failed.
    pub async fn reclaim_expired_at(&self, now: DateTime<Utc>) -> Result<ReclaimSummary> {
        let conn = self.pool.connection();
        let now_tz: DateTimeWithTimeZone = now.into();

        let expired = QueueEntryEntity::find()
            .filter(QueueEntryColumn::Status.eq(QueueStatus::Processing.as_str()))
            .filter(QueueEntryColumn::LeaseExpiresAt.lt(now_tz))
            .all(conn)
            .await?;

        let mut summary = ReclaimSummary::default();

        for entry in expired {
            let (update, outcome) = self.failure_update(
                &entry,
                LEASE_EXPIRED,
                FailureClass::Retryable { retry_after: None },
                now,
            );

            // Skip entries that were finished or re-leased since the scan
            let result = update
                .filter(QueueEntryColumn::LeaseExpiresAt.lt(now_tz))
                .exec(conn)
                .await?;

            if result.rows_affected == 0 {
                continue;
            }

            warn!(
                paper_id = %entry.paper_id,
                leased_by = entry.leased_by.as_deref().unwrap_or("unknown"),
                "Reclaimed expired lease"
            );
            self.log_failure(&entry.paper_id, LEASE_EXPIRED, &outcome);

            match outcome {
                FailureOutcome::Rescheduled { .. } => summary.requeued += 1,
                FailureOutcome::Exhausted { .. } => summary.exhausted += 1,
            }
        }

        if summary != ReclaimSummary::default() {
            info!(requeued = summary.requeued, exhausted = summary.exhausted, "Lease sweep finished");
            metrics::record_reclaim(summary.requeued, summary.exhausted);
        }

        Ok(summary)
    }

    /// Operator action: `failed -> pending` with a fresh retry budget
    pub async fn retry_failed(&self, paper_id: &str) -> Result<()> {
        let conn = self.pool.connection();
        let now: DateTimeWithTimeZone = Utc::now().into();

        let result = QueueEntryEntity::update_many()
            .col_expr(QueueEntryColumn::Status, Expr::value(QueueStatus::Pending.as_str()))
            .col_expr(QueueEntryColumn::RetryCount, Expr::value(0))
            .col_expr(QueueEntryColumn::NextEligibleAt, Expr::value(now))
            .col_expr(QueueEntryColumn::CompletedAt, Expr::value(Option::<DateTimeWithTimeZone>::None))
            .col_expr(QueueEntryColumn::UpdatedAt, Expr::value(now))
            .filter(QueueEntryColumn::PaperId.eq(paper_id))
            .filter(QueueEntryColumn::Status.eq(QueueStatus::Failed.as_str()))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(transition_error(conn, paper_id, QueueStatus::Pending).await);
        }

        info!(paper_id, "Failed entry requeued by operator");
        metrics::record_transition(QueueStatus::Pending);
        Ok(())
    }

    /// Find entry by paper ID
    pub async fn get(&self, paper_id: &str) -> Result<Option<QueueEntry>> {
        QueueEntryEntity::find()
            .filter(QueueEntryColumn::PaperId.eq(paper_id))
            .one(self.pool.connection())
            .await
            .map_err(Into::into)
    }

    /// Entry count per status; also published as gauges
    pub async fn counts(&self) -> Result<QueueCounts> {
        let mut counts = QueueCounts::default();

        for status in QueueStatus::ALL {
            let n = QueueEntryEntity::find()
                .filter(QueueEntryColumn::Status.eq(status.as_str()))
                .count(self.pool.connection())
                .await?;

            metrics::record_queue_depth(status, n);

            match status {
                QueueStatus::Pending => counts.pending = n,
                QueueStatus::Processing => counts.processing = n,
                QueueStatus::Completed => counts.completed = n,
                QueueStatus::Failed => counts.failed = n,
            }
        }

        Ok(counts)
    }

    /// Terminally failed entries, most recent first
    pub async fn failed_entries(&self, limit: u64) -> Result<Vec<QueueEntry>> {
        QueueEntryEntity::find()
            .filter(QueueEntryColumn::Status.eq(QueueStatus::Failed.as_str()))
            .order_by_desc(QueueEntryColumn::UpdatedAt)
            .limit(limit)
            .all(self.pool.connection())
            .await
            .map_err(Into::into)
    }

    /// True while anything is pending (eligible or backing off) or in flight
    pub async fn has_outstanding_work(&self) -> Result<bool> {
        let n = QueueEntryEntity::find()
            .filter(QueueEntryColumn::Status.is_in([
                QueueStatus::Pending.as_str(),
                QueueStatus::Processing.as_str(),
            ]))
            .count(self.pool.connection())
            .await?;
        Ok(n > 0)
    }

    /// Build the conditional update for a failed attempt of `entry`
    fn failure_update(
        &self,
        entry: &QueueEntry,
        error: &str,
        class: FailureClass,
        now: DateTime<Utc>,
    ) -> (UpdateMany<QueueEntryEntity>, FailureOutcome) {
        let retry_count = u32::try_from(entry.retry_count).unwrap_or(0).saturating_add(1);
        let now_tz: DateTimeWithTimeZone = now.into();

        let outcome = match class {
            FailureClass::Retryable { retry_after } if retry_count <= self.settings.max_retries => {
                let delay = self.settings.backoff.delay(retry_count, retry_after);
                FailureOutcome::Rescheduled {
                    retry_count,
                    next_eligible_at: add_delay(now, delay).into(),
                }
            }
            _ => FailureOutcome::Exhausted { retry_count },
        };

        let (status, next_eligible_at, completed_at) = match &outcome {
            FailureOutcome::Rescheduled { next_eligible_at, .. } => {
                (QueueStatus::Pending, *next_eligible_at, None)
            }
            FailureOutcome::Exhausted { .. } => (QueueStatus::Failed, now_tz, Some(now_tz)),
        };

        let update = QueueEntryEntity::update_many()
            .col_expr(QueueEntryColumn::Status, Expr::value(status.as_str()))
            .col_expr(QueueEntryColumn::RetryCount, Expr::value(i32::try_from(retry_count).unwrap_or(i32::MAX)))
            .col_expr(QueueEntryColumn::LastError, Expr::value(Some(error.to_string())))
            .col_expr(QueueEntryColumn::NextEligibleAt, Expr::value(next_eligible_at))
            .col_expr(QueueEntryColumn::LeaseExpiresAt, Expr::value(Option::<DateTimeWithTimeZone>::None))
            .col_expr(QueueEntryColumn::LeasedBy, Expr::value(Option::<String>::None))
            .col_expr(QueueEntryColumn::CompletedAt, Expr::value(completed_at))
            .col_expr(QueueEntryColumn::UpdatedAt, Expr::value(now_tz))
            .filter(QueueEntryColumn::Id.eq(entry.id))
            .filter(QueueEntryColumn::Status.eq(QueueStatus::Processing.as_str()));

        (update, outcome)
    }

    fn log_failure(&self, paper_id: &str, error: &str, outcome: &FailureOutcome) {
        match outcome {
            FailureOutcome::Rescheduled { retry_count, next_eligible_at } => {
                warn!(
                    paper_id,
                    error,
                    retry_count,
                    next_eligible_at = %next_eligible_at,
                    "Attempt failed, rescheduled"
                );
                metrics::record_transition(QueueStatus::Pending);
            }
            FailureOutcome::Exhausted { retry_count } => {
                error!(
                    paper_id,
                    error,
                    retry_count,
                    code = ?crate::errors::ErrorCode::RetryBudgetExceeded,
                    "Entry failed terminally"
                );
                metrics::record_transition(QueueStatus::Failed);
                metrics::record_exhausted(1);
            }
        }
    }
}

/// Explain why a conditional transition matched no row
async fn transition_error<C: ConnectionTrait>(conn: &C, paper_id: &str, to: QueueStatus) -> AppError {
    let current = QueueEntryEntity::find()
        .filter(QueueEntryColumn::PaperId.eq(paper_id))
        .one(conn)
        .await;

    match current {
        Ok(Some(entry)) => AppError::InvalidTransition {
            paper_id: paper_id.to_string(),
            from: entry.status,
            to: to.as_str().to_string(),
        },
        Ok(None) => AppError::EntryNotFound {
            paper_id: paper_id.to_string(),
        },
        Err(e) => e.into(),
    }
}

/// Explain why a lease-holder transition matched no row. Another holder
/// (or none, after a reclaim) means the lease was lost; the same holder in
/// the wrong state is an invalid transition.
async fn lease_error<C: ConnectionTrait>(
    conn: &C,
    paper_id: &str,
    worker_id: &str,
    to: QueueStatus,
) -> AppError {
    let current = QueueEntryEntity::find()
        .filter(QueueEntryColumn::PaperId.eq(paper_id))
        .one(conn)
        .await;

    match current {
        Ok(Some(entry)) if entry.leased_by.as_deref() != Some(worker_id) => AppError::LeaseLost {
            paper_id: paper_id.to_string(),
            worker_id: worker_id.to_string(),
        },
        Ok(_) => transition_error(conn, paper_id, to).await,
        Err(e) => e.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio_test::assert_ok;

    fn settings(max_retries: u32) -> QueueSettings {
        QueueSettings {
            max_retries,
            lease: Duration::from_secs(60),
            backoff: BackoffPolicy {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(10),
                multiplier: 2.0,
                jitter: 0.0,
                max_hint: Duration::from_secs(3_600),
            },
        }
    }

    async fn queue(max_retries: u32) -> PriorityQueue {
        PriorityQueue::new(DbPool::in_memory().await.unwrap(), settings(max_retries))
    }

    fn far_future() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::days(1)
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = settings(3).backoff;
        assert_eq!(policy.delay(1, None), Duration::from_secs(1));
        assert_eq!(policy.delay(2, None), Duration::from_secs(2));
        assert_eq!(policy.delay(3, None), Duration::from_secs(4));
        assert_eq!(policy.delay(10, None), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_honors_hint_above_cap() {
        let policy = settings(3).backoff;
        assert_eq!(policy.delay(1, Some(Duration::from_secs(30))), Duration::from_secs(30));
        // Hint below the computed delay does not shorten it
        assert_eq!(policy.delay(3, Some(Duration::from_millis(10))), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_clamps_huge_hint() {
        let policy = settings(3).backoff;
        let hint = Duration::from_secs(10_000_000_000_000);
        assert_eq!(policy.delay(1, Some(hint)), Duration::from_secs(3_600));
        assert_eq!(policy.delay(1, Some(Duration::MAX)), Duration::from_secs(3_600));
    }

    #[test]
    fn test_add_delay_saturates() {
        let now = Utc::now();
        assert_eq!(add_delay(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(add_delay(now, Duration::from_secs(5)), now + chrono::Duration::seconds(5));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let mut policy = settings(3).backoff;
        policy.jitter = 0.5;
        for _ in 0..100 {
            let d = policy.delay(3, None);
            assert!(d >= Duration::from_secs(2) && d <= Duration::from_secs(4));
        }
    }

    #[tokio::test]
    async fn test_enqueue_twice_is_noop() {
        let q = queue(3).await;
        assert_eq!(q.enqueue("A", 1.0, 0).await.unwrap(), EnqueueOutcome::Enqueued);
        assert_eq!(q.enqueue("A", 9.0, 2).await.unwrap(), EnqueueOutcome::AlreadyKnown);

        let counts = q.counts().await.unwrap();
        assert_eq!(counts.total(), 1);

        // Original priority and distance are kept
        let entry = q.get("A").await.unwrap().unwrap();
        assert_eq!(entry.priority, 1.0);
        assert_eq!(entry.distance, 0);
    }

    #[tokio::test]
    async fn test_enqueue_after_completion_is_noop() {
        let q = queue(3).await;
        q.enqueue("A", 1.0, 0).await.unwrap();
        q.dequeue_highest_priority("w1").await.unwrap().unwrap();
        q.mark_completed("A", "w1").await.unwrap();

        assert_eq!(q.enqueue("A", 5.0, 1).await.unwrap(), EnqueueOutcome::AlreadyKnown);
        let entry = q.get("A").await.unwrap().unwrap();
        assert_eq!(entry.queue_status(), Some(QueueStatus::Completed));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_bad_input() {
        let q = queue(3).await;
        assert!(matches!(
            q.enqueue("", 1.0, 0).await,
            Err(AppError::InvalidIdentifier { .. })
        ));
        assert!(matches!(
            q.enqueue("A", f64::NAN, 0).await,
            Err(AppError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_dequeue_order_priority_then_fifo() {
        let q = queue(3).await;
        q.enqueue("low", 1.0, 1).await.unwrap();
        q.enqueue("tie-first", 5.0, 1).await.unwrap();
        q.enqueue("tie-second", 5.0, 1).await.unwrap();
        q.enqueue("high", 9.0, 0).await.unwrap();

        let mut order = Vec::new();
        while let Some(entry) = q.dequeue_highest_priority("w1").await.unwrap() {
            assert_eq!(entry.queue_status(), Some(QueueStatus::Processing));
            assert_eq!(entry.leased_by.as_deref(), Some("w1"));
            order.push(entry.paper_id);
        }

        assert_eq!(order, vec!["high", "tie-first", "tie-second", "low"]);
    }

    #[tokio::test]
    async fn test_dequeue_empty_queue() {
        let q = queue(3).await;
        assert!(q.dequeue_highest_priority("w1").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dequeue_never_duplicates() {
        let q = queue(3).await;
        for i in 0..40 {
            q.enqueue(&format!("P{i}"), (i % 7) as f64, 1).await.unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..8 {
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                let worker = format!("w{w}");
                let mut claimed = Vec::new();
                while let Some(entry) = q.dequeue_highest_priority(&worker).await.unwrap() {
                    claimed.push(entry.paper_id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }

        let unique: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), unique.len());
        assert_eq!(unique.len(), 40);
        assert_eq!(q.counts().await.unwrap().processing, 40);
    }

    #[tokio::test]
    async fn test_mark_completed_requires_processing() {
        let q = queue(3).await;
        q.enqueue("A", 1.0, 0).await.unwrap();

        // Nobody holds the lease on a pending entry
        let err = q.mark_completed("A", "w1").await.unwrap_err();
        assert!(err.is_lease_lost());

        q.dequeue_highest_priority("w1").await.unwrap();
        assert_ok!(q.mark_completed("A", "w1").await);

        // Completing twice under the same lease is an invariant violation
        let err = q.mark_completed("A", "w1").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { ref from, .. } if from == "completed"));
        assert!(err.is_fatal());

        let err = q.mark_completed("missing", "w1").await.unwrap_err();
        assert!(matches!(err, AppError::EntryNotFound { .. }));
    }

    #[tokio::test]
    async fn test_stale_lease_holder_cannot_settle_entry() {
        let q = queue(3).await;
        q.enqueue("A", 1.0, 0).await.unwrap();

        let start = Utc::now();
        q.dequeue_at("w1", start).await.unwrap().unwrap();
        let summary = q.reclaim_expired_at(start + chrono::Duration::seconds(61)).await.unwrap();
        assert_eq!(summary.requeued, 1);
        let lease_start = start + chrono::Duration::seconds(62);
        let entry = q.dequeue_at("w2", lease_start).await.unwrap().unwrap();
        assert_eq!(entry.leased_by.as_deref(), Some("w2"));

        let err = q.mark_completed("A", "w1").await.unwrap_err();
        assert!(matches!(err, AppError::LeaseLost { ref worker_id, .. } if worker_id == "w1"));
        assert!(!err.is_fatal());

        let err = q
            .mark_failed("A", "w1", "late", FailureClass::Retryable { retry_after: None })
            .await
            .unwrap_err();
        assert!(err.is_lease_lost());

        // The current holder is unaffected
        let entry = q.get("A").await.unwrap().unwrap();
        assert_eq!(entry.queue_status(), Some(QueueStatus::Processing));
        assert_eq!(entry.retry_count, 1);
        assert_ok!(q.mark_completed("A", "w2").await);
    }

    #[tokio::test]
    async fn test_rate_limited_entry_waits_for_hint() {
        let q = queue(3).await;
        q.enqueue("C", 1.0, 0).await.unwrap();
        q.dequeue_highest_priority("w1").await.unwrap().unwrap();

        let before = Utc::now();
        let outcome = q
            .mark_failed(
                "C",
                "w1",
                "rate limited",
                FailureClass::Retryable { retry_after: Some(Duration::from_secs(30)) },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, FailureOutcome::Rescheduled { retry_count: 1, .. }));

        let entry = q.get("C").await.unwrap().unwrap();
        assert_eq!(entry.queue_status(), Some(QueueStatus::Pending));
        assert_eq!(entry.last_error.as_deref(), Some("rate limited"));
        assert!(entry.lease_expires_at.is_none());

        assert!(q.dequeue_highest_priority("w2").await.unwrap().is_none());
        assert!(q
            .dequeue_at("w2", before + chrono::Duration::seconds(29))
            .await
            .unwrap()
            .is_none());

        let later = Utc::now() + chrono::Duration::seconds(31);
        let again = q.dequeue_at("w2", later).await.unwrap().unwrap();
        assert_eq!(again.paper_id, "C");
        assert_eq!(again.retry_count, 1);
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_retry_budget() {
        let max_retries = 2;
        let q = queue(max_retries).await;
        q.enqueue("D", 1.0, 0).await.unwrap();

        let mut outcomes = Vec::new();
        while let Some(entry) = q.dequeue_at("w1", far_future()).await.unwrap() {
            let outcome = q
                .mark_failed(&entry.paper_id, "w1", "server error", FailureClass::Retryable { retry_after: None })
                .await
                .unwrap();
            outcomes.push(outcome);
        }

        assert_eq!(outcomes.len(), max_retries as usize + 1);
        assert_eq!(
            outcomes.last(),
            Some(&FailureOutcome::Exhausted { retry_count: max_retries + 1 })
        );

        let entry = q.get("D").await.unwrap().unwrap();
        assert_eq!(entry.queue_status(), Some(QueueStatus::Failed));
        assert!(entry.is_terminal());
        assert_eq!(q.failed_entries(10).await.unwrap().len(), 1);
        assert!(!q.has_outstanding_work().await.unwrap());
    }

    #[tokio::test]
    async fn test_permanent_failure_is_terminal() {
        let q = queue(5).await;
        q.enqueue("E", 1.0, 0).await.unwrap();
        q.dequeue_highest_priority("w1").await.unwrap();

        let outcome = q.mark_failed("E", "w1", "bad payload", FailureClass::Permanent).await.unwrap();
        assert_eq!(outcome, FailureOutcome::Exhausted { retry_count: 1 });
        assert!(q.dequeue_at("w1", far_future()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_failed_requires_processing() {
        let q = queue(3).await;
        q.enqueue("A", 1.0, 0).await.unwrap();
        q.dequeue_highest_priority("w1").await.unwrap();
        q.mark_completed("A", "w1").await.unwrap();

        let err = q
            .mark_failed("A", "w1", "x", FailureClass::Retryable { retry_after: None })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_huge_retry_after_is_clamped() {
        let q = queue(3).await;
        q.enqueue("A", 1.0, 0).await.unwrap();
        q.dequeue_highest_priority("w1").await.unwrap();

        let before = Utc::now();
        let outcome = q
            .mark_failed(
                "A",
                "w1",
                "rate limited",
                FailureClass::Retryable { retry_after: Some(Duration::from_secs(10_000_000_000_000)) },
            )
            .await
            .unwrap();

        let FailureOutcome::Rescheduled { next_eligible_at, .. } = outcome else {
            panic!("expected reschedule, got {outcome:?}");
        };
        let next: DateTime<Utc> = next_eligible_at.into();
        assert!(next >= before + chrono::Duration::seconds(3_600));
        assert!(next <= Utc::now() + chrono::Duration::seconds(3_601));
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let q = queue(3).await;
        q.enqueue("A", 1.0, 0).await.unwrap();
        q.enqueue("B", 0.5, 0).await.unwrap();

        let start = Utc::now();
        q.dequeue_at("crashed", start).await.unwrap().unwrap();

        // Lease still valid: nothing to do
        let summary = q.reclaim_expired_at(start + chrono::Duration::seconds(30)).await.unwrap();
        assert_eq!(summary, ReclaimSummary::default());

        let summary = q.reclaim_expired_at(start + chrono::Duration::seconds(61)).await.unwrap();
        assert_eq!(summary, ReclaimSummary { requeued: 1, exhausted: 0 });

        let entry = q.get("A").await.unwrap().unwrap();
        assert_eq!(entry.queue_status(), Some(QueueStatus::Pending));
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.last_error.as_deref(), Some(LEASE_EXPIRED));
        assert!(entry.leased_by.is_none());

        let again = q.dequeue_at("w2", far_future()).await.unwrap().unwrap();
        assert_eq!(again.paper_id, "A");
    }

    #[tokio::test]
    async fn test_reclaim_exhausts_budget() {
        let q = queue(0).await;
        q.enqueue("A", 1.0, 0).await.unwrap();
        let start = Utc::now();
        q.dequeue_at("crashed", start).await.unwrap().unwrap();

        let summary = q.reclaim_expired_at(start + chrono::Duration::seconds(61)).await.unwrap();
        assert_eq!(summary, ReclaimSummary { requeued: 0, exhausted: 1 });
        assert_eq!(q.counts().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_operator_retry_of_failed_entry() {
        let q = queue(0).await;
        q.enqueue("A", 1.0, 0).await.unwrap();
        q.dequeue_highest_priority("w1").await.unwrap();
        q.mark_failed("A", "w1", "boom", FailureClass::Retryable { retry_after: None })
            .await
            .unwrap();

        assert_ok!(q.retry_failed("A").await);
        let entry = q.get("A").await.unwrap().unwrap();
        assert_eq!(entry.queue_status(), Some(QueueStatus::Pending));
        assert_eq!(entry.retry_count, 0);
        assert!(q.has_outstanding_work().await.unwrap());

        // Only failed entries can be retried
        assert!(q.retry_failed("A").await.is_err());
    }
}
