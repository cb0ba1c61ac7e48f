use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::Value;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row as _, Transaction};
use staysync_core::{
    is_identifier, CatalogError, HeuristicCandidate, HeuristicSubject, RegionCode, Row, TableSpec, REGION_COLUMN,
    SURROGATE_COLUMN,
};
use tracing::debug;

use crate::children::KeyMap;
use crate::dedup::{DedupError, DedupReport, Deduplicator};
use crate::resolve::{DirectPlan, HeuristicPlan, PassReport};
use crate::store::{LoadSession, SyncStore};
use crate::upsert::{UpsertCounts, UpsertPlan};
use crate::SyncError;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    schema: String,
}

impl PgStore {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Result<Self, SyncError> {
        let schema = schema.into();
        if !is_identifier(&schema) {
            return Err(SyncError::Catalog(CatalogError::InvalidIdentifier {
                context: "schema".to_string(),
                name: schema,
            }));
        }
        Ok(Self { pool, schema })
    }

    pub async fn connect(database_url: &str, schema: &str, max_connections: u32) -> Result<Self, SyncError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Self::new(pool, schema)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), MigrateError> {
        MIGRATOR.run(&self.pool).await
    }
}

#[async_trait]
impl SyncStore for PgStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn schema(&self) -> &str {
        &self.schema
    }

    async fn begin(&self) -> Result<Box<dyn LoadSession>, SyncError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgSession {
            tx,
            schema: self.schema.clone(),
        }))
    }

    async fn deduplicate(&self, table: &TableSpec) -> Result<DedupReport, DedupError> {
        Deduplicator::new(self.pool.clone(), self.schema.clone())
            .run(table, Utc::now())
            .await
    }
}

struct PgSession {
    tx: Transaction<'static, Postgres>,
    schema: String,
}

#[async_trait]
impl LoadSession for PgSession {
    async fn upsert(&mut self, plan: &UpsertPlan, rows: Vec<Row>) -> Result<UpsertCounts, SyncError> {
        let Some(first) = rows.first() else {
            return Ok(UpsertCounts::default());
        };
        let columns: Vec<String> = first.keys().cloned().collect();
        let sql = plan.statement(&columns);
        let payload = Value::Array(rows.into_iter().map(Value::Object).collect());

        let returned = sqlx::query(&sql)
            .bind(payload)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|err| SyncError::from_db(plan.table().name(), err))?;

        let mut counts = UpsertCounts::default();
        for row in returned {
            if row.try_get::<bool, _>("inserted")? {
                counts.inserted += 1;
            } else {
                counts.updated += 1;
            }
        }
        Ok(counts)
    }

    async fn key_map(&mut self, table: &str, external_column: &str, region: &RegionCode) -> Result<KeyMap, SyncError> {
        for name in [table, external_column] {
            if !is_identifier(name) {
                return Err(SyncError::InvalidColumn {
                    table: table.to_string(),
                    column: name.to_string(),
                });
            }
        }
        let sql = format!(
            "SELECT {SURROGATE_COLUMN} AS id, {external_column}::text AS ext \
             FROM {schema}.{table} WHERE {REGION_COLUMN} = $1 AND {external_column} IS NOT NULL",
            schema = self.schema,
        );
        let rows = sqlx::query(&sql)
            .bind(region.as_str())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|err| SyncError::from_db(table, err))?;

        let mut map = KeyMap::new();
        for row in rows {
            let ext: String = row.try_get("ext")?;
            let trimmed = ext.trim();
            if !trimmed.is_empty() {
                map.insert(trimmed, row.try_get::<i64, _>("id")?);
            }
        }
        debug!(table, %region, keys = map.len(), "loaded key map");
        Ok(map)
    }

    async fn resolve_direct(&mut self, plan: &DirectPlan, region: &RegionCode) -> Result<PassReport, SyncError> {
        let candidates: i64 = sqlx::query_scalar(&plan.candidate_count_statement())
            .bind(region.as_str())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|err| SyncError::from_db(&plan.table, err))?;
        let resolved = sqlx::query(&plan.update_statement())
            .bind(region.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(|err| SyncError::from_db(&plan.table, err))?
            .rows_affected();

        Ok(PassReport {
            pass: plan.label(),
            column: plan.column.clone(),
            resolved,
            candidates: candidates.max(0) as u64,
            by_rule: Default::default(),
        })
    }

    async fn heuristic_subjects(
        &mut self,
        plan: &HeuristicPlan,
        region: &RegionCode,
    ) -> Result<Vec<HeuristicSubject>, SyncError> {
        let rows = sqlx::query(&plan.subjects_statement())
            .bind(region.as_str())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|err| SyncError::from_db(&plan.table, err))?;

        let mut subjects = Vec::with_capacity(rows.len());
        for row in rows {
            subjects.push(HeuristicSubject {
                id: row.try_get("id")?,
                scope: row.try_get("scope")?,
                start: row.try_get::<Option<NaiveDate>, _>("start_date")?,
                end: row.try_get::<Option<NaiveDate>, _>("end_date")?,
                scheduled: row.try_get::<Option<NaiveDate>, _>("scheduled_date")?,
                category: row.try_get("category")?,
            });
        }
        Ok(subjects)
    }

    async fn heuristic_candidates(
        &mut self,
        plan: &HeuristicPlan,
        region: &RegionCode,
    ) -> Result<Vec<HeuristicCandidate>, SyncError> {
        let rows = sqlx::query(&plan.candidates_statement())
            .bind(region.as_str())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|err| SyncError::from_db(&plan.parent_table, err))?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            candidates.push(HeuristicCandidate {
                id: row.try_get("id")?,
                scope: row.try_get("scope")?,
                start: row.try_get::<Option<NaiveDate>, _>("start_date")?,
                end: row.try_get::<Option<NaiveDate>, _>("end_date")?,
            });
        }
        Ok(candidates)
    }

    async fn apply_links(&mut self, plan: &HeuristicPlan, links: &[(i64, i64)]) -> Result<u64, SyncError> {
        let (child_ids, parent_ids): (Vec<i64>, Vec<i64>) = links.iter().copied().unzip();
        let applied = sqlx::query(&plan.apply_statement())
            .bind(child_ids)
            .bind(parent_ids)
            .execute(&mut *self.tx)
            .await
            .map_err(|err| SyncError::from_db(&plan.table, err))?
            .rows_affected();
        Ok(applied)
    }

    async fn commit(self: Box<Self>) -> Result<(), SyncError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), SyncError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
