//! Load side of staysync: natural-key upserts, FK resolution, child/bridge
//! resolution, deduplication, and the per-(region, entity) job orchestration
//! that ties them to a page source and a store.

use thiserror::Error;

pub mod children;
pub mod config;
pub mod dedup;
pub mod memory;
pub mod pg;
pub mod pipeline;
pub mod resolve;
pub mod runner;
pub mod status;
pub mod store;
pub mod upsert;

pub use children::{resolve_children, ChildResolution, KeyMap, KeyMaps};
pub use config::SyncConfig;
pub use dedup::{plan_canonicalization, CanonicalPlan, DedupError, DedupReport, Deduplicator};
pub use memory::MemoryStore;
pub use pg::PgStore;
pub use pipeline::{plan_jobs, EngineSettings, SyncEngine, SyncJob};
pub use resolve::{resolve_heuristic, run_fk_passes, DirectPlan, HeuristicOutcome, HeuristicPlan, PassReport};
pub use runner::{build_scheduler, JobOutcome, JobRunner};
pub use status::{LogReporter, PgSyncLog, RecordingReporter, StatusReporter};
pub use store::{LoadSession, SyncStore};
pub use upsert::{upsert_rows, UpsertCounts, UpsertPlan};

pub const CRATE_NAME: &str = "staysync-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Catalog(#[from] staysync_core::CatalogError),
    #[error(transparent)]
    Source(#[from] staysync_source::SourceError),
    #[error("row for {table} has no value for natural key column {column}")]
    MissingKeyColumn { table: String, column: String },
    #[error("invalid column name {column:?} for {table}")]
    InvalidColumn { table: String, column: String },
    #[error("unknown table {0}")]
    UnknownTable(String),
    #[error("constraint violation on {table}: {message}")]
    Constraint {
        table: String,
        constraint: Option<String>,
        message: String,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl SyncError {
    /// Maps integrity-class database errors (SQLSTATE 23xxx) to `Constraint`.
    pub fn from_db(table: &str, err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.code().is_some_and(|code| code.starts_with("23")) {
                return SyncError::Constraint {
                    table: table.to_string(),
                    constraint: db.constraint().map(ToString::to_string),
                    message: db.message().to_string(),
                };
            }
        }
        SyncError::Database(err)
    }
}
