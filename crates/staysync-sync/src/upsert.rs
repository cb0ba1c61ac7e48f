//! Natural-key upsert engine.
//!
//! Every statement rendered here carries `ON CONFLICT (<natural key>)`; a
//! `TableSpec` cannot exist without a non-empty key, so there is no path to an
//! untargeted insert.

use std::collections::{BTreeSet, HashSet};

use serde_json::Value;
use staysync_core::{is_identifier, Row, TableSpec, SURROGATE_COLUMN};
use tracing::{debug, warn};

use crate::store::LoadSession;
use crate::SyncError;

/// Bookkeeping column touched on every re-observation.
pub const SYNCED_AT_COLUMN: &str = "synced_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpsertCounts {
    pub inserted: u64,
    pub updated: u64,
}

impl UpsertCounts {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated
    }
}

impl std::ops::AddAssign for UpsertCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
    }
}

#[derive(Debug, Clone)]
pub struct UpsertPlan {
    schema: String,
    table: TableSpec,
}

impl UpsertPlan {
    pub fn new(schema: impl Into<String>, table: TableSpec) -> Self {
        Self {
            schema: schema.into(),
            table,
        }
    }

    pub fn table(&self) -> &TableSpec {
        &self.table
    }

    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table.name())
    }

    /// Single-statement batch upsert of a JSON array bound as `$1`.
    ///
    /// Key columns are never in the `SET` list; FK columns keep an existing
    /// value (`COALESCE(current, incoming)`).
    pub fn statement(&self, columns: &[String]) -> String {
        let qualified = self.qualified_table();
        let column_list = columns.join(", ");
        let key = self.table.natural_key();

        let mut assignments: Vec<String> = columns
            .iter()
            .filter(|c| !key.contains(c))
            .map(|c| {
                if self.table.is_fk_column(c) {
                    format!("{c} = COALESCE({}.{c}, EXCLUDED.{c})", self.table.name())
                } else {
                    format!("{c} = EXCLUDED.{c}")
                }
            })
            .collect();
        assignments.push(format!("{SYNCED_AT_COLUMN} = now()"));

        format!(
            "INSERT INTO {qualified} ({column_list}) \
             SELECT {column_list} FROM jsonb_populate_recordset(NULL::{qualified}, $1) \
             ON CONFLICT ({conflict}) DO UPDATE SET {set} \
             RETURNING (xmax = 0) AS inserted",
            conflict = key.columns().join(", "),
            set = assignments.join(", "),
        )
    }
}

/// Column set shared by a batch of rows, in first-seen order.
pub fn batch_columns(table: &TableSpec, rows: &[Row]) -> Result<Vec<String>, SyncError> {
    let mut seen = BTreeSet::new();
    let mut columns = Vec::new();
    for row in rows {
        for column in row.keys() {
            if column == SURROGATE_COLUMN || column == SYNCED_AT_COLUMN {
                return Err(SyncError::InvalidColumn {
                    table: table.name().to_string(),
                    column: column.clone(),
                });
            }
            if !is_identifier(column) {
                return Err(SyncError::InvalidColumn {
                    table: table.name().to_string(),
                    column: column.clone(),
                });
            }
            if seen.insert(column.as_str()) {
                columns.push(column.clone());
            }
        }
    }
    Ok(columns)
}

/// Upserts `rows` into the plan's table in chunks of `batch_size`.
///
/// Rows repeating a natural key already seen in this call are collapsed to the
/// first occurrence. A row without a value for a key column is a
/// configuration defect and fails the call.
pub async fn upsert_rows(
    session: &mut dyn LoadSession,
    plan: &UpsertPlan,
    rows: Vec<Row>,
    batch_size: usize,
) -> Result<UpsertCounts, SyncError> {
    let table = plan.table();
    let key = table.natural_key();
    let mut counts = UpsertCounts::default();
    if rows.is_empty() {
        return Ok(counts);
    }

    let columns = batch_columns(table, &rows)?;
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(rows.len());
    let mut collapsed = 0usize;
    for mut row in rows {
        if let Some(column) = key.missing_column(&row) {
            return Err(SyncError::MissingKeyColumn {
                table: table.name().to_string(),
                column: column.to_string(),
            });
        }
        if !seen.insert(key.identity_of(&row)) {
            collapsed += 1;
            continue;
        }
        for column in &columns {
            row.entry(column.clone()).or_insert(Value::Null);
        }
        unique.push(row);
    }
    if collapsed > 0 {
        warn!(table = table.name(), collapsed, "collapsed rows repeating a natural key");
    }

    let batch_size = batch_size.max(1);
    let mut chunks = Vec::new();
    let mut rest = unique;
    while rest.len() > batch_size {
        let tail = rest.split_off(batch_size);
        chunks.push(rest);
        rest = tail;
    }
    chunks.push(rest);

    for chunk in chunks {
        let len = chunk.len();
        let chunk_counts = session.upsert(plan, chunk).await?;
        debug!(
            table = table.name(),
            rows = len,
            inserted = chunk_counts.inserted,
            updated = chunk_counts.updated,
            "upserted chunk"
        );
        counts += chunk_counts;
    }
    Ok(counts)
}
