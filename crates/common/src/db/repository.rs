//! Graph store: papers, citation edges and unavailable markers
//!
//! Every write is idempotent and commutative so concurrent workers that
//! discover the same neighbor from different parents need no extra locking:
//! numeric fields are last-write-wins, title/year are write-once, and the
//! edge set only ever grows.

use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::{AppError, Result};
use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Paper attributes as delivered by one fetch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPaper {
    pub paper_id: String,
    pub title: Option<String>,
    pub year: Option<i32>,
    pub abstract_text: Option<String>,
    pub citation_count: Option<i64>,
    pub reference_count: Option<i64>,
    pub pdf_url: Option<String>,
}

/// Outcome of a paper upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaperWrite {
    Created,
    Refreshed,
}

/// Outcome of an edge upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeWrite {
    Inserted,
    AlreadyPresent,
    /// Source and target are the same paper; nothing stored
    SelfLoop,
}

/// Graph store operations bound to one connection or transaction
pub struct GraphStore<'c, C: ConnectionTrait> {
    conn: &'c C,
}

impl<'c, C: ConnectionTrait> GraphStore<'c, C> {
    pub fn new(conn: &'c C) -> Self {
        Self { conn }
    }

    /// Insert the paper, or refresh an existing row without touching its
    /// write-once fields.
    pub async fn upsert_paper(&self, paper: &NewPaper) -> Result<PaperWrite> {
        if paper.paper_id.trim().is_empty() {
            return Err(AppError::InvalidIdentifier {
                id: paper.paper_id.clone(),
            });
        }

        let now: DateTimeWithTimeZone = Utc::now().into();

        let model = PaperActiveModel {
            paper_id: Set(paper.paper_id.clone()),
            title: Set(paper.title.clone()),
            year: Set(paper.year),
            abstract_text: Set(paper.abstract_text.clone()),
            citation_count: Set(paper.citation_count),
            reference_count: Set(paper.reference_count),
            pdf_url: Set(paper.pdf_url.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let inserted = PaperEntity::insert(model)
            .on_conflict(
                OnConflict::column(PaperColumn::PaperId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.conn)
            .await?;

        if inserted > 0 {
            debug!(paper_id = %paper.paper_id, "Paper created");
            return Ok(PaperWrite::Created);
        }

        // Refreshable fields: only overwrite with values the fetch actually carried
        let mut refresh = PaperEntity::update_many()
            .col_expr(PaperColumn::UpdatedAt, Expr::value(now))
            .filter(PaperColumn::PaperId.eq(paper.paper_id.as_str()));

        if let Some(count) = paper.citation_count {
            refresh = refresh.col_expr(PaperColumn::CitationCount, Expr::value(count));
        }
        if let Some(count) = paper.reference_count {
            refresh = refresh.col_expr(PaperColumn::ReferenceCount, Expr::value(count));
        }
        if let Some(text) = &paper.abstract_text {
            refresh = refresh.col_expr(PaperColumn::AbstractText, Expr::value(text.clone()));
        }
        if let Some(url) = &paper.pdf_url {
            refresh = refresh.col_expr(PaperColumn::PdfUrl, Expr::value(url.clone()));
        }

        refresh.exec(self.conn).await?;

        // Write-once fields: fill only if still unset
        if let Some(title) = &paper.title {
            PaperEntity::update_many()
                .col_expr(PaperColumn::Title, Expr::value(title.clone()))
                .filter(PaperColumn::PaperId.eq(paper.paper_id.as_str()))
                .filter(PaperColumn::Title.is_null())
                .exec(self.conn)
                .await?;
        }
        if let Some(year) = paper.year {
            PaperEntity::update_many()
                .col_expr(PaperColumn::Year, Expr::value(year))
                .filter(PaperColumn::PaperId.eq(paper.paper_id.as_str()))
                .filter(PaperColumn::Year.is_null())
                .exec(self.conn)
                .await?;
        }

        debug!(paper_id = %paper.paper_id, "Paper refreshed");
        Ok(PaperWrite::Refreshed)
    }

    /// Record an edge; duplicates and self-loops are silently absorbed.
    pub async fn upsert_edge(
        &self,
        source_id: &str,
        target_id: &str,
        relation: EdgeRelation,
    ) -> Result<EdgeWrite> {
        if source_id == target_id {
            warn!(paper_id = %source_id, relation = %relation, "Dropping self-citation");
            return Ok(EdgeWrite::SelfLoop);
        }

        let model = CitationEdgeActiveModel {
            source_id: Set(source_id.to_string()),
            target_id: Set(target_id.to_string()),
            kind: Set(relation.as_str().to_string()),
            created_at: Set(Utc::now().into()),
        };

        let inserted = CitationEdgeEntity::insert(model)
            .on_conflict(
                OnConflict::columns([
                    CitationEdgeColumn::SourceId,
                    CitationEdgeColumn::TargetId,
                    CitationEdgeColumn::Kind,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(self.conn)
            .await?;

        Ok(if inserted > 0 {
            EdgeWrite::Inserted
        } else {
            EdgeWrite::AlreadyPresent
        })
    }

    /// Check whether a paper record exists
    pub async fn paper_exists(&self, paper_id: &str) -> Result<bool> {
        let count = PaperEntity::find_by_id(paper_id.to_string())
            .count(self.conn)
            .await?;
        Ok(count > 0)
    }

    /// Find paper by ID
    pub async fn find_paper(&self, paper_id: &str) -> Result<Option<Paper>> {
        PaperEntity::find_by_id(paper_id.to_string())
            .one(self.conn)
            .await
            .map_err(Into::into)
    }

    /// Edges whose source is the given paper, ordered for stable output
    pub async fn edges_from(&self, paper_id: &str) -> Result<Vec<CitationEdge>> {
        CitationEdgeEntity::find()
            .filter(CitationEdgeColumn::SourceId.eq(paper_id))
            .order_by_asc(CitationEdgeColumn::Kind)
            .order_by_asc(CitationEdgeColumn::TargetId)
            .all(self.conn)
            .await
            .map_err(Into::into)
    }

    /// Remember that the API has no record of this paper
    pub async fn mark_unavailable(&self, paper_id: &str, reason: &str) -> Result<()> {
        let model = UnavailablePaperActiveModel {
            paper_id: Set(paper_id.to_string()),
            reason: Set(reason.to_string()),
            recorded_at: Set(Utc::now().into()),
        };

        UnavailablePaperEntity::insert(model)
            .on_conflict(
                OnConflict::column(UnavailablePaperColumn::PaperId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.conn)
            .await?;

        Ok(())
    }

    /// Check whether the paper was reported as absent
    pub async fn is_unavailable(&self, paper_id: &str) -> Result<bool> {
        let count = UnavailablePaperEntity::find_by_id(paper_id.to_string())
            .count(self.conn)
            .await?;
        Ok(count > 0)
    }
}

/// Repository for graph data access outside of a transaction
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Underlying pool, for callers that open their own transaction
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Graph store on the shared connection
    pub fn graph(&self) -> GraphStore<'_, DatabaseConnection> {
        GraphStore::new(self.pool.connection())
    }

    /// Number of stored papers
    pub async fn paper_count(&self) -> Result<u64> {
        PaperEntity::find()
            .count(self.pool.connection())
            .await
            .map_err(Into::into)
    }

    /// Number of stored edges
    pub async fn edge_count(&self) -> Result<u64> {
        CitationEdgeEntity::find()
            .count(self.pool.connection())
            .await
            .map_err(Into::into)
    }
}
