//! In-process store with the same load semantics as the Postgres one:
//! natural-key upserts, monotonic FK columns, region-scoped key maps and
//! all-or-nothing sessions. Backs `--dry-run` and the test suite.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use staysync_core::{
    date_from_value, external_key, HeuristicCandidate, HeuristicSubject, Referrer, RegionCode, Row, TableSpec,
    REGION_COLUMN, SURROGATE_COLUMN,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::children::KeyMap;
use crate::dedup::{backup_table_name, plan_canonicalization, plan_repoint, CanonicalPlan, DedupError, DedupReport};
use crate::resolve::{DirectPlan, HeuristicPlan, PassReport};
use crate::store::{LoadSession, SyncStore};
use crate::upsert::{UpsertCounts, UpsertPlan};
use crate::SyncError;

type CheckFn = Arc<dyn Fn(&Row) -> bool + Send + Sync>;

#[derive(Clone)]
struct CheckConstraint {
    table: String,
    name: String,
    check: CheckFn,
}

impl fmt::Debug for CheckConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckConstraint")
            .field("table", &self.table)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct MemTable {
    next_id: i64,
    rows: BTreeMap<i64, Row>,
    /// Whether the natural-key unique constraint is in place.
    constrained: bool,
}

impl MemTable {
    fn new(constrained: bool) -> Self {
        Self {
            next_id: 1,
            rows: BTreeMap::new(),
            constrained,
        }
    }

    fn in_region<'a>(&'a self, region: &'a RegionCode) -> impl Iterator<Item = (i64, &'a Row)> + 'a {
        self.rows
            .iter()
            .filter(move |(_, row)| row.get(REGION_COLUMN).and_then(Value::as_str) == Some(region.as_str()))
            .map(|(id, row)| (*id, row))
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryDb {
    tables: BTreeMap<String, MemTable>,
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    db: Arc<Mutex<MemoryDb>>,
    checks: Arc<Vec<CheckConstraint>>,
    schema: String,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            db: Arc::new(Mutex::new(MemoryDb::default())),
            checks: Arc::new(Vec::new()),
            schema: "staysync".to_string(),
        }
    }

    /// Rejects any written row of `table` for which `check` returns false.
    pub fn with_check_constraint(
        mut self,
        table: impl Into<String>,
        name: impl Into<String>,
        check: impl Fn(&Row) -> bool + Send + Sync + 'static,
    ) -> Self {
        Arc::make_mut(&mut self.checks).push(CheckConstraint {
            table: table.into(),
            name: name.into(),
            check: Arc::new(check),
        });
        self
    }

    /// Inserts a row with a fixed surrogate id, bypassing the natural key.
    /// A table first created this way has no unique constraint until
    /// `deduplicate` installs one.
    pub async fn insert_raw(&self, table: &str, id: i64, row: Row) {
        let mut db = self.db.lock().await;
        let table = db
            .tables
            .entry(table.to_string())
            .or_insert_with(|| MemTable::new(false));
        table.next_id = table.next_id.max(id + 1);
        table.rows.insert(id, row);
    }

    /// Committed rows ordered by surrogate id, each carrying its `id`.
    pub async fn rows(&self, table: &str) -> Vec<Row> {
        let db = self.db.lock().await;
        db.tables
            .get(table)
            .map(|t| {
                t.rows
                    .iter()
                    .map(|(id, row)| {
                        let mut row = row.clone();
                        row.insert(SURROGATE_COLUMN.to_string(), Value::from(*id));
                        row
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn table_names(&self) -> Vec<String> {
        self.db.lock().await.tables.keys().cloned().collect()
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn schema(&self) -> &str {
        &self.schema
    }

    async fn begin(&self) -> Result<Box<dyn LoadSession>, SyncError> {
        let guard = self.db.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemorySession {
            guard,
            work,
            checks: self.checks.clone(),
        }))
    }

    async fn deduplicate(&self, table: &TableSpec) -> Result<DedupReport, DedupError> {
        let mut db = self.db.lock().await;
        let mem = db
            .tables
            .get(table.name())
            .ok_or_else(|| DedupError::UnknownTable(table.name().to_string()))?;

        let rows_before = mem.rows.len() as u64;
        let plan = plan_canonicalization(table.natural_key(), mem.rows.iter().map(|(id, row)| (*id, row)));
        let distinct_keys = plan.keep.len() as u64;

        let backup_table = backup_table_name(table.name(), Utc::now());
        let mut backup = mem.clone();
        backup.constrained = false;

        let mut canonical = mem.clone();
        for id in &plan.discard {
            canonical.rows.remove(id);
        }
        let rows_after = canonical.rows.len() as u64;
        if rows_after != distinct_keys {
            return Err(DedupError::CountMismatch {
                table: table.name().to_string(),
                expected: distinct_keys,
                actual: rows_after,
            });
        }
        let constraint_added = !canonical.constrained;
        canonical.constrained = true;

        let mut staged: BTreeMap<String, MemTable> = BTreeMap::new();
        let mut references_moved = 0;
        let mut referrers_removed = 0;
        for referrer in table.referrers() {
            let Some(source) = staged.get(&referrer.table).or_else(|| db.tables.get(&referrer.table)) else {
                continue;
            };
            let repoint = plan_repoint(referrer, &plan, source.rows.iter().map(|(id, row)| (*id, row)));
            let mut updated = source.clone();
            for id in &repoint.removed {
                updated.rows.remove(id);
            }
            for id in &repoint.moved {
                if let Some(row) = updated.rows.get_mut(id) {
                    let survivor = row
                        .get(&referrer.column)
                        .and_then(Value::as_i64)
                        .and_then(|target| plan.canonical.get(&target).copied());
                    if let Some(survivor) = survivor {
                        row.insert(referrer.column.clone(), Value::from(survivor));
                    }
                }
            }
            references_moved += repoint.moved.len() as u64;
            referrers_removed += repoint.removed.len() as u64;
            staged.insert(referrer.table.clone(), updated);
        }
        for referrer in table.referrers() {
            if let Some(id) = staged.get(&referrer.table).and_then(|t| dangling(referrer, t, &plan)) {
                return Err(DedupError::DanglingReference {
                    table: referrer.table.clone(),
                    column: referrer.column.clone(),
                    id,
                });
            }
        }

        db.tables.extend(staged);
        db.tables.insert(backup_table.clone(), backup);
        db.tables.insert(table.name().to_string(), canonical);
        info!(
            table = table.name(),
            rows_before,
            removed = plan.discard.len(),
            references_moved,
            backup = %backup_table,
            "deduplicated in memory"
        );

        Ok(DedupReport {
            table: table.name().to_string(),
            rows_before,
            distinct_keys,
            removed: plan.discard.len() as u64,
            rows_after,
            backup_table,
            constraint_added,
            references_moved,
            referrers_removed,
        })
    }
}

/// First reference in `table` still pointing at a discarded row.
fn dangling(referrer: &Referrer, table: &MemTable, plan: &CanonicalPlan) -> Option<i64> {
    table
        .rows
        .values()
        .filter_map(|row| row.get(&referrer.column).and_then(Value::as_i64))
        .find(|id| plan.canonical.contains_key(id))
}

struct MemorySession {
    guard: OwnedMutexGuard<MemoryDb>,
    work: MemoryDb,
    checks: Arc<Vec<CheckConstraint>>,
}

impl MemorySession {
    fn table(&self, name: &str) -> Result<&MemTable, SyncError> {
        self.work
            .tables
            .get(name)
            .ok_or_else(|| SyncError::UnknownTable(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemTable, SyncError> {
        self.work
            .tables
            .get_mut(name)
            .ok_or_else(|| SyncError::UnknownTable(name.to_string()))
    }

    fn check(&self, table: &str, row: &Row) -> Result<(), SyncError> {
        match self.checks.iter().find(|c| c.table == table && !(c.check)(row)) {
            Some(failed) => Err(SyncError::Constraint {
                table: table.to_string(),
                constraint: Some(failed.name.clone()),
                message: format!("new row for relation \"{table}\" violates check constraint \"{}\"", failed.name),
            }),
            None => Ok(()),
        }
    }
}

fn is_null(row: &Row, column: &str) -> bool {
    row.get(column).map_or(true, Value::is_null)
}

#[async_trait]
impl LoadSession for MemorySession {
    async fn upsert(&mut self, plan: &UpsertPlan, rows: Vec<Row>) -> Result<UpsertCounts, SyncError> {
        let spec = plan.table();
        let name = spec.name().to_string();
        let key = spec.natural_key();
        let mut counts = UpsertCounts::default();

        let mut pending = Vec::with_capacity(rows.len());
        {
            let table = self
                .work
                .tables
                .entry(name.clone())
                .or_insert_with(|| MemTable::new(true));
            if !table.constrained {
                return Err(SyncError::Constraint {
                    table: name,
                    constraint: None,
                    message: "no unique constraint matches the ON CONFLICT target".to_string(),
                });
            }
            let index: HashMap<Vec<Option<String>>, i64> = table
                .rows
                .iter()
                .map(|(id, row)| (key.identity_of(row), *id))
                .collect();

            for incoming in rows {
                match index.get(&key.identity_of(&incoming)) {
                    Some(&id) => {
                        let mut merged = table.rows.get(&id).cloned().unwrap_or_default();
                        for (column, value) in incoming {
                            if key.contains(&column) {
                                continue;
                            }
                            if spec.is_fk_column(&column) && !is_null(&merged, &column) {
                                continue;
                            }
                            merged.insert(column, value);
                        }
                        pending.push((Some(id), merged));
                    }
                    None => pending.push((None, incoming)),
                }
            }
        }

        for (_, row) in &pending {
            self.check(&name, row)?;
        }
        let table = self.table_mut(&name)?;
        for (id, row) in pending {
            match id {
                Some(id) => {
                    table.rows.insert(id, row);
                    counts.updated += 1;
                }
                None => {
                    let id = table.next_id;
                    table.next_id += 1;
                    table.rows.insert(id, row);
                    counts.inserted += 1;
                }
            }
        }
        Ok(counts)
    }

    async fn key_map(&mut self, table: &str, external_column: &str, region: &RegionCode) -> Result<KeyMap, SyncError> {
        let Some(mem) = self.work.tables.get(table) else {
            return Ok(KeyMap::new());
        };
        Ok(mem
            .in_region(region)
            .filter_map(|(id, row)| row.get(external_column).and_then(external_key).map(|ext| (ext, id)))
            .collect())
    }

    async fn resolve_direct(&mut self, plan: &DirectPlan, region: &RegionCode) -> Result<PassReport, SyncError> {
        let parents = self.key_map(&plan.parent_table, &plan.parent_external_column, region).await?;
        let mut report = PassReport {
            pass: plan.label(),
            column: plan.column.clone(),
            ..PassReport::default()
        };
        let Ok(table) = self.table(&plan.table) else {
            return Ok(report);
        };

        let mut links = Vec::new();
        for (id, row) in table.in_region(region) {
            if !is_null(row, &plan.column) {
                continue;
            }
            let Some(via) = row.get(&plan.via).and_then(external_key) else {
                continue;
            };
            report.candidates += 1;
            if let Some(parent_id) = parents.get(&via) {
                links.push((id, parent_id));
            }
        }

        let table = self.table_mut(&plan.table)?;
        for (id, parent_id) in links {
            if let Some(row) = table.rows.get_mut(&id) {
                row.insert(plan.column.clone(), Value::from(parent_id));
                report.resolved += 1;
            }
        }
        Ok(report)
    }

    async fn heuristic_subjects(
        &mut self,
        plan: &HeuristicPlan,
        region: &RegionCode,
    ) -> Result<Vec<HeuristicSubject>, SyncError> {
        let Ok(table) = self.table(&plan.table) else {
            return Ok(Vec::new());
        };
        let date = |row: &Row, column: &Option<String>| column.as_ref().and_then(|c| row.get(c)).and_then(date_from_value);
        Ok(table
            .in_region(region)
            .filter(|(_, row)| is_null(row, &plan.column))
            .filter_map(|(id, row)| {
                let scope = row.get(&plan.scope_column).and_then(Value::as_i64)?;
                Some(HeuristicSubject {
                    id,
                    scope,
                    start: date(row, &plan.subject.start),
                    end: date(row, &plan.subject.end),
                    scheduled: date(row, &plan.subject.scheduled),
                    category: plan
                        .subject
                        .category
                        .as_ref()
                        .and_then(|c| row.get(c))
                        .and_then(Value::as_str)
                        .map(ToString::to_string),
                })
            })
            .collect())
    }

    async fn heuristic_candidates(
        &mut self,
        plan: &HeuristicPlan,
        region: &RegionCode,
    ) -> Result<Vec<HeuristicCandidate>, SyncError> {
        let Ok(table) = self.table(&plan.parent_table) else {
            return Ok(Vec::new());
        };
        Ok(table
            .in_region(region)
            .filter_map(|(id, row)| {
                let scope = row.get(&plan.parent_scope_column).and_then(Value::as_i64)?;
                Some(HeuristicCandidate {
                    id,
                    scope,
                    start: row.get(&plan.candidate.start).and_then(date_from_value),
                    end: row.get(&plan.candidate.end).and_then(date_from_value),
                })
            })
            .collect())
    }

    async fn apply_links(&mut self, plan: &HeuristicPlan, links: &[(i64, i64)]) -> Result<u64, SyncError> {
        let table = self.table_mut(&plan.table)?;
        let mut applied = 0;
        for (child_id, parent_id) in links {
            if let Some(row) = table.rows.get_mut(child_id) {
                if is_null(row, &plan.column) {
                    row.insert(plan.column.clone(), Value::from(*parent_id));
                    applied += 1;
                }
            }
        }
        Ok(applied)
    }

    async fn commit(self: Box<Self>) -> Result<(), SyncError> {
        let MemorySession { mut guard, work, .. } = *self;
        *guard = work;
        debug!("memory session committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), SyncError> {
        debug!("memory session rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::run_fk_passes;
    use crate::upsert::upsert_rows;
    use serde_json::json;
    use staysync_core::{Catalog, NaturalKey};

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn region(code: &str) -> RegionCode {
        RegionCode::new(code).unwrap()
    }

    fn properties() -> UpsertPlan {
        let key = NaturalKey::new(["property_id", "region_code"]).unwrap();
        UpsertPlan::new("staysync", TableSpec::new("properties", key).unwrap())
    }

    fn tasks() -> UpsertPlan {
        let key = NaturalKey::new(["task_id", "region_code"]).unwrap();
        UpsertPlan::new(
            "staysync",
            TableSpec::new("tasks", key)
                .unwrap()
                .with_fk_columns(["property_pk", "reservation_pk"]),
        )
    }

    async fn load(store: &MemoryStore, plan: &UpsertPlan, rows: Vec<Row>) -> Result<UpsertCounts, SyncError> {
        let mut session = store.begin().await?;
        let counts = upsert_rows(session.as_mut(), plan, rows, 100).await?;
        session.commit().await?;
        Ok(counts)
    }

    #[tokio::test]
    async fn reloading_a_record_updates_the_single_row() {
        let store = MemoryStore::new();
        let first = load(
            &store,
            &properties(),
            vec![row(json!({"property_id": "P1", "region_code": "r1", "property_name": "Cabin"}))],
        )
        .await
        .unwrap();
        let second = load(
            &store,
            &properties(),
            vec![row(json!({"property_id": "P1", "region_code": "r1", "property_name": "Lodge"}))],
        )
        .await
        .unwrap();

        assert_eq!(first, UpsertCounts { inserted: 1, updated: 0 });
        assert_eq!(second, UpsertCounts { inserted: 0, updated: 1 });
        let rows = store.rows("properties").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["property_name"], json!("Lodge"));
        assert_eq!(rows[0]["id"], json!(1));
    }

    #[tokio::test]
    async fn same_external_id_in_two_regions_is_two_rows() {
        let store = MemoryStore::new();
        load(
            &store,
            &properties(),
            vec![
                row(json!({"property_id": "P1", "region_code": "r1"})),
                row(json!({"property_id": "P1", "region_code": "r2"})),
            ],
        )
        .await
        .unwrap();
        assert_eq!(store.rows("properties").await.len(), 2);
    }

    #[tokio::test]
    async fn resolved_foreign_keys_are_never_cleared_or_replaced() {
        let store = MemoryStore::new();
        let plan = tasks();
        load(&store, &plan, vec![row(json!({"task_id": "T1", "region_code": "r1", "property_pk": 5}))])
            .await
            .unwrap();
        load(&store, &plan, vec![row(json!({"task_id": "T1", "region_code": "r1", "property_pk": null}))])
            .await
            .unwrap();
        load(&store, &plan, vec![row(json!({"task_id": "T1", "region_code": "r1", "property_pk": 9, "reservation_pk": 2}))])
            .await
            .unwrap();

        let rows = store.rows("tasks").await;
        assert_eq!(rows[0]["property_pk"], json!(5));
        assert_eq!(rows[0]["reservation_pk"], json!(2));
    }

    #[tokio::test]
    async fn constraint_violation_leaves_no_partial_writes() {
        let store = MemoryStore::new().with_check_constraint("tasks", "tasks_status_check", |row| {
            row.get("task_status").and_then(Value::as_str) != Some("bogus")
        });

        let mut session = store.begin().await.unwrap();
        upsert_rows(session.as_mut(), &properties(), vec![row(json!({"property_id": "P1", "region_code": "r1"}))], 10)
            .await
            .unwrap();
        let err = upsert_rows(
            session.as_mut(),
            &tasks(),
            vec![row(json!({"task_id": "T1", "region_code": "r1", "task_status": "bogus"}))],
            10,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::Constraint { ref constraint, .. } if constraint.as_deref() == Some("tasks_status_check")));
        session.rollback().await.unwrap();

        assert!(store.rows("properties").await.is_empty());
        assert!(store.rows("tasks").await.is_empty());
    }

    #[tokio::test]
    async fn dropped_session_discards_its_writes() {
        let store = MemoryStore::new();
        {
            let mut session = store.begin().await.unwrap();
            upsert_rows(session.as_mut(), &properties(), vec![row(json!({"property_id": "P1", "region_code": "r1"}))], 10)
                .await
                .unwrap();
        }
        assert!(store.rows("properties").await.is_empty());
    }

    #[tokio::test]
    async fn dedup_keeps_the_lowest_id_and_enables_upserts() {
        let store = MemoryStore::new();
        for id in [12, 10, 14, 11, 13] {
            store
                .insert_raw("task_comments", id, row(json!({"task_pk": 1, "comment_id": "5", "comment": format!("copy {id}")})))
                .await;
        }
        let table = TableSpec::new("task_comments", NaturalKey::new(["task_pk", "comment_id"]).unwrap())
            .unwrap()
            .with_fk_columns(["task_pk"]);

        let plan = UpsertPlan::new("staysync", table.clone());
        let before = load(&store, &plan, vec![row(json!({"task_pk": 1, "comment_id": "5"}))]).await;
        assert!(matches!(before, Err(SyncError::Constraint { .. })));

        let report = store.deduplicate(&table).await.unwrap();
        assert_eq!(report.rows_before, 5);
        assert_eq!(report.removed, 4);
        assert!(report.constraint_added);
        let rows = store.rows("task_comments").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(10));
        assert_eq!(store.rows(&report.backup_table).await.len(), 5);

        let counts = load(&store, &plan, vec![row(json!({"task_pk": 1, "comment_id": "5", "comment": "edited"}))])
            .await
            .unwrap();
        assert_eq!(counts.updated, 1);
        assert_eq!(store.rows("task_comments").await[0]["comment"], json!("edited"));

        let again = store.deduplicate(&table).await.unwrap();
        assert_eq!(again.removed, 0);
        assert!(!again.constraint_added);
    }

    #[tokio::test]
    async fn dedup_of_a_parent_moves_child_rows_to_the_survivor() {
        let catalog = Catalog::load(std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../catalog.yaml")).unwrap();
        let store = MemoryStore::new();
        for id in [10, 11] {
            store
                .insert_raw("tasks", id, row(json!({"task_id": "9001", "region_code": "r1", "task_name": format!("copy {id}")})))
                .await;
        }
        store.insert_raw("task_comments", 1, row(json!({"task_pk": 10, "comment_id": "c1"}))).await;
        store.insert_raw("task_comments", 2, row(json!({"task_pk": 11, "comment_id": "c1"}))).await;
        store.insert_raw("task_comments", 3, row(json!({"task_pk": 11, "comment_id": "c2"}))).await;
        store.insert_raw("task_assignments", 1, row(json!({"task_pk": 11, "assignee_id": "501"}))).await;

        let report = store.deduplicate(&catalog.table_spec("tasks").unwrap()).await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.references_moved, 2);
        assert_eq!(report.referrers_removed, 1);

        let tasks = store.rows("tasks").await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["id"], json!(10));
        let comments: Vec<(Value, Value)> = store
            .rows("task_comments")
            .await
            .into_iter()
            .map(|r| (r["id"].clone(), r["task_pk"].clone()))
            .collect();
        assert_eq!(comments, vec![(json!(1), json!(10)), (json!(3), json!(10))]);
        assert_eq!(store.rows("task_assignments").await[0]["task_pk"], json!(10));
    }

    #[tokio::test]
    async fn padded_external_ids_still_link() {
        let catalog = Catalog::load(std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../catalog.yaml")).unwrap();
        let store = MemoryStore::new();
        let tasks_plan = UpsertPlan::new("staysync", catalog.entity("tasks").unwrap().table_spec().unwrap());
        load(&store, &properties(), vec![row(json!({"property_id": "H1", "region_code": "r1"}))])
            .await
            .unwrap();
        load(
            &store,
            &tasks_plan,
            vec![
                row(json!({"task_id": "T1", "region_code": "r1", "home_id": " H1 "})),
                row(json!({"task_id": "T2", "region_code": "r1", "home_id": "  "})),
            ],
        )
        .await
        .unwrap();

        let mut session = store.begin().await.unwrap();
        let reports = run_fk_passes(session.as_mut(), "staysync", &catalog, catalog.entity("tasks").unwrap(), &region("r1"))
            .await
            .unwrap();
        session.commit().await.unwrap();

        assert_eq!((reports[0].resolved, reports[0].candidates), (1, 1));
        assert_eq!(store.rows("tasks").await[0]["property_pk"], json!(1));
    }

    #[tokio::test]
    async fn fk_passes_link_within_the_region_only() {
        let catalog = Catalog::load(std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../catalog.yaml")).unwrap();
        let store = MemoryStore::new();
        let reservations_plan = UpsertPlan::new(
            "staysync",
            catalog.entity("reservations").unwrap().table_spec().unwrap(),
        );
        let tasks_plan = UpsertPlan::new("staysync", catalog.entity("tasks").unwrap().table_spec().unwrap());

        load(
            &store,
            &properties(),
            vec![
                row(json!({"property_id": "H1", "region_code": "r2"})),
                row(json!({"property_id": "H1", "region_code": "r1"})),
            ],
        )
        .await
        .unwrap();
        load(
            &store,
            &reservations_plan,
            vec![row(json!({
                "reservation_id": "R1", "region_code": "r1", "property_pk": 2,
                "checkin_date": "2024-05-01", "checkout_date": "2024-05-05"
            }))],
        )
        .await
        .unwrap();
        load(
            &store,
            &tasks_plan,
            vec![
                row(json!({"task_id": "T1", "region_code": "r1", "home_id": "H1", "scheduled_date": "2024-05-03", "type_department": "housekeeping"})),
                row(json!({"task_id": "T2", "region_code": "r1", "home_id": "H9"})),
            ],
        )
        .await
        .unwrap();

        let mut session = store.begin().await.unwrap();
        let reports = run_fk_passes(session.as_mut(), "staysync", &catalog, catalog.entity("tasks").unwrap(), &region("r1"))
            .await
            .unwrap();
        session.commit().await.unwrap();

        assert_eq!(reports[0].pass, "direct:property_pk");
        assert_eq!((reports[0].resolved, reports[0].candidates), (1, 2));
        assert_eq!(reports[2].pass, "heuristic:reservation_pk");
        assert_eq!(reports[2].resolved, 1);
        assert_eq!(reports[2].by_rule["scheduled_within_window"], 1);

        let rows = store.rows("tasks").await;
        assert_eq!(rows[0]["property_pk"], json!(2));
        assert_eq!(rows[0]["reservation_pk"], json!(1));
        assert!(rows[1].get("property_pk").map_or(true, Value::is_null));
    }
}
