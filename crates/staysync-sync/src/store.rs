use async_trait::async_trait;
use staysync_core::{HeuristicCandidate, HeuristicSubject, RegionCode, Row, TableSpec};

use crate::children::KeyMap;
use crate::dedup::{DedupError, DedupReport};
use crate::resolve::{DirectPlan, HeuristicPlan, PassReport};
use crate::upsert::{UpsertCounts, UpsertPlan};
use crate::SyncError;

/// One transaction. Everything a run writes goes through a single session and
/// becomes visible only on `commit`; dropping a session discards its writes.
#[async_trait]
pub trait LoadSession: Send {
    /// Rows share one column set and carry distinct natural keys.
    async fn upsert(&mut self, plan: &UpsertPlan, rows: Vec<Row>) -> Result<UpsertCounts, SyncError>;

    /// External id -> surrogate id for every row of `table` in `region`.
    async fn key_map(&mut self, table: &str, external_column: &str, region: &RegionCode) -> Result<KeyMap, SyncError>;

    async fn resolve_direct(&mut self, plan: &DirectPlan, region: &RegionCode) -> Result<PassReport, SyncError>;

    async fn heuristic_subjects(
        &mut self,
        plan: &HeuristicPlan,
        region: &RegionCode,
    ) -> Result<Vec<HeuristicSubject>, SyncError>;

    async fn heuristic_candidates(
        &mut self,
        plan: &HeuristicPlan,
        region: &RegionCode,
    ) -> Result<Vec<HeuristicCandidate>, SyncError>;

    /// Writes `(subject id, candidate id)` links, only where the FK is still null.
    async fn apply_links(&mut self, plan: &HeuristicPlan, links: &[(i64, i64)]) -> Result<u64, SyncError>;

    async fn commit(self: Box<Self>) -> Result<(), SyncError>;

    async fn rollback(self: Box<Self>) -> Result<(), SyncError>;
}

#[async_trait]
pub trait SyncStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Schema every table name is qualified with.
    fn schema(&self) -> &str;

    async fn begin(&self) -> Result<Box<dyn LoadSession>, SyncError>;

    /// Collapses duplicate natural keys to the lowest surrogate id and installs
    /// the natural-key constraint. Must run without concurrent writers.
    async fn deduplicate(&self, table: &TableSpec) -> Result<DedupReport, DedupError>;
}
