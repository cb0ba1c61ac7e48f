//! One-shot canonicalization of a table whose natural key was not enforced:
//! keep the lowest surrogate id per key, move every reference to a discarded
//! row onto its survivor, delete the rest, then install the unique constraint
//! so duplicates cannot come back.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use staysync_core::{NaturalKey, Referrer, Row, TableSpec, SURROGATE_COLUMN};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

const MAX_IDENTIFIER: usize = 63;
const BACKUP_INFIX: &str = "_backup_";
const CONSTRAINT_SUFFIX: &str = "_natural_key";
const CANONICAL_MAP: &str = "dedup_canonical";

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("unknown table {0}")]
    UnknownTable(String),
    #[error("{table}: expected {expected} rows after dedup, found {actual}; rolled back")]
    CountMismatch { table: String, expected: u64, actual: u64 },
    #[error("dedup requires exclusive access to {0}")]
    Busy(String),
    #[error("{table}.{column} still references removed row {id}")]
    DanglingReference { table: String, column: String, id: i64 },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CanonicalPlan {
    /// Surviving surrogate id per natural key.
    pub keep: Vec<i64>,
    pub discard: Vec<i64>,
    /// Keys that had more than one row.
    pub duplicate_keys: usize,
    /// Discarded id -> surviving id of the same key.
    pub canonical: BTreeMap<i64, i64>,
}

/// Groups rows by natural key (nulls compare equal) and keeps the lowest id.
pub fn plan_canonicalization<'a, I>(key: &NaturalKey, rows: I) -> CanonicalPlan
where
    I: IntoIterator<Item = (i64, &'a Row)>,
{
    let mut groups: HashMap<Vec<Option<String>>, Vec<i64>> = HashMap::new();
    for (id, row) in rows {
        groups.entry(key.identity_of(row)).or_default().push(id);
    }

    let mut plan = CanonicalPlan::default();
    for mut ids in groups.into_values() {
        ids.sort_unstable();
        if ids.len() > 1 {
            plan.duplicate_keys += 1;
        }
        plan.keep.push(ids[0]);
        plan.discard.extend_from_slice(&ids[1..]);
        plan.canonical.extend(ids[1..].iter().map(|id| (*id, ids[0])));
    }
    plan.keep.sort_unstable();
    plan.discard.sort_unstable();
    plan
}

/// How one referring table follows a canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RepointPlan {
    /// Rows whose reference moves to the surviving id.
    pub moved: Vec<i64>,
    /// Rows that would duplicate a natural key once moved. Rows already under
    /// the survivor win, then the lowest id.
    pub removed: Vec<i64>,
}

pub fn plan_repoint<'a, I>(referrer: &Referrer, plan: &CanonicalPlan, rows: I) -> RepointPlan
where
    I: IntoIterator<Item = (i64, &'a Row)>,
{
    let survivors: BTreeSet<i64> = plan.canonical.values().copied().collect();
    let keyed = referrer.natural_key.contains(&referrer.column);

    let mut repoint = RepointPlan::default();
    let mut groups: HashMap<Vec<Option<String>>, Vec<(bool, i64)>> = HashMap::new();
    for (id, row) in rows {
        let Some(target) = row.get(&referrer.column).and_then(Value::as_i64) else {
            continue;
        };
        let canonical = plan.canonical.get(&target).copied();
        if !keyed {
            if canonical.is_some() {
                repoint.moved.push(id);
            }
            continue;
        }
        if canonical.is_none() && !survivors.contains(&target) {
            continue;
        }
        let mut moved_row = row.clone();
        moved_row.insert(referrer.column.clone(), Value::from(canonical.unwrap_or(target)));
        groups
            .entry(referrer.natural_key.identity_of(&moved_row))
            .or_default()
            .push((canonical.is_some(), id));
    }

    for mut members in groups.into_values() {
        members.sort_unstable();
        let (first_moves, first) = members[0];
        if first_moves {
            repoint.moved.push(first);
        }
        repoint.removed.extend(members[1..].iter().map(|(_, id)| *id));
    }
    repoint.moved.sort_unstable();
    repoint.removed.sort_unstable();
    repoint
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DedupReport {
    pub table: String,
    pub rows_before: u64,
    pub distinct_keys: u64,
    pub removed: u64,
    pub rows_after: u64,
    pub backup_table: String,
    pub constraint_added: bool,
    /// References moved from discarded rows to their survivors.
    pub references_moved: u64,
    /// Referring rows dropped because moving them would duplicate a key.
    pub referrers_removed: u64,
}

/// `<table>_backup_<YYYYMMDD_HHMMSS>`, shortening the table part so the name
/// stays a valid identifier.
pub fn backup_table_name(table: &str, at: DateTime<Utc>) -> String {
    let stamp = at.format("%Y%m%d_%H%M%S").to_string();
    let room = MAX_IDENTIFIER - BACKUP_INFIX.len() - stamp.len();
    let head: String = table.chars().take(room).collect();
    format!("{head}{BACKUP_INFIX}{stamp}")
}

pub fn constraint_name(table: &str) -> String {
    let room = MAX_IDENTIFIER - CONSTRAINT_SUFFIX.len();
    let head: String = table.chars().take(room).collect();
    format!("{head}{CONSTRAINT_SUFFIX}")
}

fn qualified(schema: &str, table: &str) -> String {
    format!("{schema}.{table}")
}

pub fn distinct_count_statement(schema: &str, table: &TableSpec) -> String {
    format!(
        "SELECT count(*) FROM (SELECT DISTINCT {key} FROM {qualified}) AS keys",
        key = table.natural_key().columns().join(", "),
        qualified = qualified(schema, table.name()),
    )
}

/// Temporary `(discarded_id, canonical_id)` map, built from the same window
/// the delete uses.
pub fn canonical_map_statement(schema: &str, table: &TableSpec) -> String {
    format!(
        "CREATE TEMP TABLE {CANONICAL_MAP} ON COMMIT DROP AS \
         SELECT {SURROGATE_COLUMN} AS discarded_id, canonical_id FROM (\
         SELECT {SURROGATE_COLUMN}, \
         first_value({SURROGATE_COLUMN}) OVER (PARTITION BY {key} ORDER BY {SURROGATE_COLUMN}) AS canonical_id, \
         row_number() OVER (PARTITION BY {key} ORDER BY {SURROGATE_COLUMN}) AS rn \
         FROM {qualified}) AS ranked WHERE rn > 1",
        key = table.natural_key().columns().join(", "),
        qualified = qualified(schema, table.name()),
    )
}

/// Deletes referring rows that would collide on their natural key once moved.
/// `None` when the reference is not part of that key.
pub fn referrer_collision_statement(schema: &str, referrer: &Referrer) -> Option<String> {
    if !referrer.natural_key.contains(&referrer.column) {
        return None;
    }
    let column = &referrer.column;
    let partition = std::iter::once(format!("coalesce(m.canonical_id, c.{column})"))
        .chain(
            referrer
                .natural_key
                .columns()
                .iter()
                .filter(|c| *c != column)
                .map(|c| format!("c.{c}")),
        )
        .collect::<Vec<_>>()
        .join(", ");
    let qualified = qualified(schema, &referrer.table);
    Some(format!(
        "DELETE FROM {qualified} WHERE {SURROGATE_COLUMN} IN (\
         SELECT {SURROGATE_COLUMN} FROM (\
         SELECT c.{SURROGATE_COLUMN}, row_number() OVER (PARTITION BY {partition} \
         ORDER BY (m.discarded_id IS NOT NULL), c.{SURROGATE_COLUMN}) AS rn \
         FROM {qualified} c LEFT JOIN {CANONICAL_MAP} m ON c.{column} = m.discarded_id \
         WHERE c.{column} IN (SELECT canonical_id FROM {CANONICAL_MAP} UNION SELECT discarded_id FROM {CANONICAL_MAP})\
         ) AS ranked WHERE rn > 1)"
    ))
}

pub fn repoint_statement(schema: &str, referrer: &Referrer) -> String {
    format!(
        "UPDATE {qualified} AS c SET {column} = m.canonical_id FROM {CANONICAL_MAP} m WHERE c.{column} = m.discarded_id",
        qualified = qualified(schema, &referrer.table),
        column = referrer.column,
    )
}

pub fn delete_statement(schema: &str, table: &TableSpec) -> String {
    let qualified = qualified(schema, table.name());
    format!(
        "DELETE FROM {qualified} WHERE {SURROGATE_COLUMN} IN (\
         SELECT {SURROGATE_COLUMN} FROM (\
         SELECT {SURROGATE_COLUMN}, row_number() OVER (PARTITION BY {key} ORDER BY {SURROGATE_COLUMN}) AS rn \
         FROM {qualified}) AS ranked WHERE rn > 1)",
        key = table.natural_key().columns().join(", "),
    )
}

pub fn add_constraint_statement(schema: &str, table: &TableSpec) -> String {
    format!(
        "ALTER TABLE {qualified} ADD CONSTRAINT {name} UNIQUE ({key})",
        qualified = qualified(schema, table.name()),
        name = constraint_name(table.name()),
        key = table.natural_key().columns().join(", "),
    )
}

/// Postgres implementation; runs in one transaction under an exclusive lock.
#[derive(Debug, Clone)]
pub struct Deduplicator {
    pool: PgPool,
    schema: String,
}

impl Deduplicator {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    pub async fn run(&self, table: &TableSpec, at: DateTime<Utc>) -> Result<DedupReport, DedupError> {
        let span = info_span!("dedup", schema = %self.schema, table = table.name());
        self.run_inner(table, at).instrument(span).await
    }

    async fn run_inner(&self, table: &TableSpec, at: DateTime<Utc>) -> Result<DedupReport, DedupError> {
        let qualified = qualified(&self.schema, table.name());
        let mut tx = self.pool.begin().await?;

        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                 WHERE table_schema = $1 AND table_name = $2
            )
            "#,
        )
        .bind(&self.schema)
        .bind(table.name())
        .fetch_one(&mut *tx)
        .await?;
        if !exists {
            return Err(DedupError::UnknownTable(qualified));
        }

        sqlx::query("SET LOCAL lock_timeout = '30s'").execute(&mut *tx).await?;
        if let Err(err) = sqlx::query(&format!("LOCK TABLE {qualified} IN ACCESS EXCLUSIVE MODE"))
            .execute(&mut *tx)
            .await
        {
            // 55P03 lock_not_available
            if let sqlx::Error::Database(db) = &err {
                if db.code().as_deref() == Some("55P03") {
                    return Err(DedupError::Busy(qualified));
                }
            }
            return Err(err.into());
        }

        let rows_before: i64 = sqlx::query_scalar(&format!("SELECT count(*) FROM {qualified}"))
            .fetch_one(&mut *tx)
            .await?;
        let distinct_keys: i64 = sqlx::query_scalar(&distinct_count_statement(&self.schema, table))
            .fetch_one(&mut *tx)
            .await?;
        info!(rows_before, distinct_keys, "counted rows");

        let backup_table = backup_table_name(table.name(), at);
        sqlx::query(&format!("CREATE TABLE {}.{backup_table} AS TABLE {qualified}", self.schema))
            .execute(&mut *tx)
            .await?;
        info!(backup = %backup_table, "backed up table");

        sqlx::query(&canonical_map_statement(&self.schema, table))
            .execute(&mut *tx)
            .await?;
        let mut references_moved = 0;
        let mut referrers_removed = 0;
        for referrer in table.referrers() {
            let referring = self::qualified(&self.schema, &referrer.table);
            sqlx::query(&format!("LOCK TABLE {referring} IN SHARE ROW EXCLUSIVE MODE"))
                .execute(&mut *tx)
                .await?;
            if let Some(sql) = referrer_collision_statement(&self.schema, referrer) {
                referrers_removed += sqlx::query(&sql).execute(&mut *tx).await?.rows_affected();
            }
            let moved = sqlx::query(&repoint_statement(&self.schema, referrer))
                .execute(&mut *tx)
                .await?
                .rows_affected();
            references_moved += moved;
            info!(referrer = %referring, column = %referrer.column, moved, "moved references to surviving rows");
        }

        let removed = sqlx::query(&delete_statement(&self.schema, table))
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let rows_after: i64 = sqlx::query_scalar(&format!("SELECT count(*) FROM {qualified}"))
            .fetch_one(&mut *tx)
            .await?;
        if rows_after != distinct_keys {
            warn!(rows_after, distinct_keys, "row count does not match distinct keys; rolling back");
            tx.rollback().await?;
            return Err(DedupError::CountMismatch {
                table: table.name().to_string(),
                expected: distinct_keys as u64,
                actual: rows_after as u64,
            });
        }

        let constraint = constraint_name(table.name());
        let present: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                  FROM pg_constraint c
                  JOIN pg_class t ON t.oid = c.conrelid
                  JOIN pg_namespace n ON n.oid = t.relnamespace
                 WHERE n.nspname = $1
                   AND t.relname = $2
                   AND c.conname = $3
            )
            "#,
        )
        .bind(&self.schema)
        .bind(table.name())
        .bind(&constraint)
        .fetch_one(&mut *tx)
        .await?;

        let constraint_added = !present;
        if constraint_added {
            sqlx::query(&add_constraint_statement(&self.schema, table)).execute(&mut *tx).await?;
            info!(%constraint, "added natural key constraint");
        }

        tx.commit().await?;
        info!(removed, rows_after, "dedup committed");

        Ok(DedupReport {
            table: table.name().to_string(),
            rows_before: rows_before as u64,
            distinct_keys: distinct_keys as u64,
            removed,
            rows_after: rows_after as u64,
            backup_table,
            constraint_added,
            references_moved,
            referrers_removed,
        })
    }
}
