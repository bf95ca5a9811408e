//! Discovery queue entry entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Queue entry status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 4] = [
        QueueStatus::Pending,
        QueueStatus::Processing,
        QueueStatus::Completed,
        QueueStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for QueueStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(format!("unknown queue status: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "discovery_queue")]
pub struct Model {
    /// Insertion sequence, used as the FIFO tie-breaker
    #[sea_orm(primary_key)]
    pub id: i32,

    #[sea_orm(unique)]
    pub paper_id: String,

    pub priority: f64,

    /// Hops from the nearest seed
    pub distance: i32,

    pub status: String,

    pub retry_count: i32,

    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,

    /// Earliest time the entry may be dequeued again
    pub next_eligible_at: DateTimeWithTimeZone,

    pub lease_expires_at: Option<DateTimeWithTimeZone>,

    pub leased_by: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,

    pub completed_at: Option<DateTimeWithTimeZone>,
}

impl Model {
    /// Get the entry status as an enum
    pub fn queue_status(&self) -> Option<QueueStatus> {
        QueueStatus::try_from(self.status.as_str()).ok()
    }

    /// Check if the entry is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.queue_status(),
            Some(QueueStatus::Completed | QueueStatus::Failed)
        )
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
