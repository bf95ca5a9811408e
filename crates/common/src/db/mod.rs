//! Database layer for CiteGraph
//!
//! Provides:
//! - SeaORM entity models
//! - Graph store (papers, citation edges, unavailable markers)
//! - Connection pool management and schema bootstrap

pub mod models;
mod repository;

pub use repository::{EdgeWrite, GraphStore, NewPaper, PaperWrite, Repository};

use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};
use models::*;
use sea_orm::sea_query::Index;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DatabaseTransaction, Schema,
    TransactionTrait,
};
use std::time::Duration;
use tracing::info;

/// Database connection pool wrapper
#[derive(Clone)]
pub struct DbPool {
    conn: DatabaseConnection,
}

impl DbPool {
    /// Create a new database pool from configuration
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to database...");

        let mut opts = ConnectOptions::new(&config.url);
        opts.max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .sqlx_logging(false);

        let conn = Database::connect(opts)
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Failed to connect: {}", e),
            })?;

        info!("Database connection established");

        Ok(Self { conn })
    }

    /// Private in-memory SQLite database with the schema applied.
    ///
    /// Pinned to one connection: every pooled connection to `sqlite::memory:`
    /// would otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let mut opts = ConnectOptions::new("sqlite::memory:");
        opts.max_connections(1).min_connections(1).sqlx_logging(false);

        let conn = Database::connect(opts)
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let pool = Self { conn };
        pool.migrate().await?;
        Ok(pool)
    }

    /// Shared connection handle
    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    /// Start a transaction; dropping it without commit rolls back
    pub async fn begin(&self) -> Result<DatabaseTransaction> {
        self.conn.begin().await.map_err(Into::into)
    }

    /// Ping the database to check connectivity
    pub async fn ping(&self) -> Result<()> {
        self.conn
            .execute_unprepared("SELECT 1")
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Ping failed: {}", e),
            })?;

        Ok(())
    }

    /// Create tables and indexes that do not exist yet
    pub async fn migrate(&self) -> Result<()> {
        migrate(&self.conn).await
    }
}

/// Create every table used by the graph store and the priority queue.
pub async fn migrate<C: ConnectionTrait>(db: &C) -> Result<()> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let mut tables = vec![
        schema.create_table_from_entity(PaperEntity),
        schema.create_table_from_entity(CitationEdgeEntity),
        schema.create_table_from_entity(UnavailablePaperEntity),
        schema.create_table_from_entity(QueueEntryEntity),
    ];

    for table in tables.iter_mut() {
        table.if_not_exists();
        db.execute(backend.build(&*table)).await?;
    }

    // Dequeue scans pending entries by priority
    let dequeue_index = Index::create()
        .name("idx_discovery_queue_status_priority")
        .table(QueueEntryEntity)
        .col(QueueEntryColumn::Status)
        .col(QueueEntryColumn::Priority)
        .if_not_exists()
        .to_owned();
    db.execute(backend.build(&dequeue_index)).await?;

    // Reverse lookups of who cites a paper
    let target_index = Index::create()
        .name("idx_citation_edges_target")
        .table(CitationEdgeEntity)
        .col(CitationEdgeColumn::TargetId)
        .if_not_exists()
        .to_owned();
    db.execute(backend.build(&target_index)).await?;

    info!("Database schema ready");
    Ok(())
}
