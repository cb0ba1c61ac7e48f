//! Per-(region, entity) sync job: extract, transform, then load everything in
//! one store session (upsert, FK passes, children) and report the outcome.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use staysync_core::{Catalog, CatalogError, ChildSource, EntitySpec, RegionCode, RegionSpec, SyncStatusRecord};
use staysync_source::{collect_all, PageRequest, PageSource, INCREMENTAL_PARAM};
use staysync_transform::{TransformedBatch, Transformer};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::children::{resolve_children, KeyMaps};
use crate::config::SyncConfig;
use crate::resolve::run_fk_passes;
use crate::status::StatusReporter;
use crate::store::{LoadSession, SyncStore};
use crate::upsert::{upsert_rows, UpsertCounts, UpsertPlan};
use crate::SyncError;

pub const COMPANY_PARAM: &str = "company_id";

/// One independently schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
    pub region: RegionCode,
    pub entity: String,
    pub incremental: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub batch_size: usize,
    pub page_size: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            page_size: 100,
        }
    }
}

impl From<&SyncConfig> for EngineSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            page_size: config.page_size,
        }
    }
}

/// Jobs for the selected regions and entities, region by region, each
/// region's entities in dependency order.
pub fn plan_jobs(
    catalog: &Catalog,
    region_selector: &str,
    entity_selector: &str,
    incremental: bool,
) -> Result<Vec<SyncJob>, CatalogError> {
    let regions = catalog.select_regions(region_selector)?;
    let entities = catalog.select_entities(entity_selector)?;
    Ok(regions
        .iter()
        .flat_map(|region| {
            entities.iter().map(move |entity| SyncJob {
                region: region.code.clone(),
                entity: entity.name.clone(),
                incremental,
            })
        })
        .collect())
}

#[derive(Debug, Default)]
struct LoadStats {
    counts: UpsertCounts,
    fk_resolved: u64,
    child_dropped: usize,
}

pub struct SyncEngine {
    catalog: Arc<Catalog>,
    source: Arc<dyn PageSource>,
    store: Arc<dyn SyncStore>,
    reporter: Arc<dyn StatusReporter>,
    settings: EngineSettings,
}

impl SyncEngine {
    pub fn new(
        catalog: Arc<Catalog>,
        source: Arc<dyn PageSource>,
        store: Arc<dyn SyncStore>,
        reporter: Arc<dyn StatusReporter>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            catalog,
            source,
            store,
            reporter,
            settings,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn store(&self) -> &dyn SyncStore {
        self.store.as_ref()
    }

    /// Runs one job to completion. Never fails: errors end up in the returned
    /// (and reported) status record.
    pub async fn run(&self, job: &SyncJob) -> SyncStatusRecord {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "sync_job",
            %run_id,
            region = %job.region,
            entity = %job.entity,
            source = self.source.name(),
            store = self.store.name()
        );
        self.run_inner(job).instrument(span).await
    }

    async fn run_inner(&self, job: &SyncJob) -> SyncStatusRecord {
        let mut record = SyncStatusRecord::running(job.region.clone(), job.entity.clone(), Utc::now());
        self.report(&record).await;

        let outcome = self.execute(job, &mut record).await;
        let record = match outcome {
            Ok(()) => record.succeeded(Utc::now()),
            Err(err) => {
                error!(error = %err, "sync job failed");
                record.failed(Utc::now(), err.to_string())
            }
        };
        info!(
            status = record.status.as_str(),
            processed = record.records_processed,
            inserted = record.records_inserted,
            updated = record.records_updated,
            fk_resolved = record.fk_resolved_count,
            "sync job finished"
        );
        self.report(&record).await;
        record
    }

    async fn report(&self, record: &SyncStatusRecord) {
        if let Err(err) = self.reporter.report(record).await {
            warn!(error = %err, "status reporter failed");
        }
    }

    async fn execute(&self, job: &SyncJob, record: &mut SyncStatusRecord) -> Result<(), SyncError> {
        let entity = self.catalog.entity(&job.entity).ok_or_else(|| CatalogError::UnknownEntity {
            referenced_by: "job".to_string(),
            name: job.entity.clone(),
        })?;
        let region = self
            .catalog
            .region(job.region.as_str())
            .ok_or_else(|| CatalogError::UnknownRegion(job.region.to_string()))?;

        let records = self.extract(job, entity, region).await?;
        record.records_processed = records.len() as u64;

        let transformer = Transformer::new(entity, job.region.clone());
        let mut batch = transformer.transform_batch(&records);
        self.fetch_endpoint_children(&transformer, &job.region, &mut batch).await;

        let mut session = self.store.begin().await?;
        let loaded = self.load(session.as_mut(), entity, &job.region, batch).await;
        match loaded {
            Ok(stats) => {
                session.commit().await?;
                record.records_inserted = stats.counts.inserted;
                record.records_updated = stats.counts.updated;
                record.fk_resolved_count = stats.fk_resolved;
                if stats.child_dropped > 0 {
                    info!(child_dropped = stats.child_dropped, "child rows skipped this run");
                }
                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = session.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn first_request(&self, job: &SyncJob, entity: &EntitySpec, region: &RegionSpec) -> PageRequest {
        let mut request = PageRequest::first(job.region.clone(), entity.endpoint.clone(), self.settings.page_size);
        if entity.company_filter {
            if let Some(company_id) = region.company_id {
                request = request.with_param(COMPANY_PARAM, company_id.to_string());
            }
        }
        if job.incremental && entity.supports_incremental {
            match self.reporter.last_success(&job.region, &entity.name).await {
                Ok(Some(cutoff)) => {
                    info!(%cutoff, "incremental extract");
                    request = request.with_param(INCREMENTAL_PARAM, cutoff.to_rfc3339());
                }
                Ok(None) => info!("no previous successful run; full extract"),
                Err(err) => warn!(error = %err, "could not read incremental cutoff; full extract"),
            }
        }
        request
    }

    async fn extract(&self, job: &SyncJob, entity: &EntitySpec, region: &RegionSpec) -> Result<Vec<Value>, SyncError> {
        let request = self.first_request(job, entity, region).await;
        let Some(partition) = &entity.partition else {
            return Ok(collect_all(self.source.as_ref(), request).await?);
        };

        let parent = self.catalog.entity(&partition.parent).ok_or_else(|| CatalogError::UnknownEntity {
            referenced_by: entity.name.clone(),
            name: partition.parent.clone(),
        })?;
        let values: BTreeSet<String> = {
            let mut session = self.store.begin().await?;
            let map = session
                .key_map(&parent.table, &parent.external_id.column, &job.region)
                .await;
            session.rollback().await?;
            map?.iter().map(|(ext, _)| ext.to_string()).collect()
        };
        info!(parent = %parent.name, partitions = values.len(), "partitioned extract");

        let mut records = Vec::new();
        for value in values {
            let request = request.clone().with_param(partition.param.clone(), value.clone());
            match collect_all(self.source.as_ref(), request).await {
                Ok(mut page) => records.append(&mut page),
                Err(err) => warn!(param = %partition.param, %value, error = %err, "partition fetch failed; skipping"),
            }
        }
        Ok(records)
    }

    async fn fetch_endpoint_children(&self, transformer: &Transformer<'_>, region: &RegionCode, batch: &mut TransformedBatch) {
        let entity = transformer.entity();
        let parent_ids: Vec<String> = batch.external_ids(&entity.external_id.column).collect();

        for child in &entity.children {
            let ChildSource::Endpoint { template } = &child.source else {
                continue;
            };
            let mut rows = Vec::new();
            let mut failed = 0usize;
            for parent_id in &parent_ids {
                let endpoint = template.replace("{id}", parent_id);
                let request = PageRequest::first(region.clone(), endpoint, self.settings.page_size);
                let records = match collect_all(self.source.as_ref(), request).await {
                    Ok(records) => records,
                    Err(err) => {
                        failed += 1;
                        warn!(child = %child.name, parent = %parent_id, error = %err, "child fetch failed; skipping");
                        continue;
                    }
                };
                for item in &records {
                    match transformer.transform_child(child, parent_id, item) {
                        Ok(row) => rows.push(row),
                        Err(reason) => {
                            batch.child_dropped += 1;
                            warn!(child = %child.name, parent = %parent_id, %reason, "dropping child record");
                        }
                    }
                }
            }
            info!(child = %child.name, parents = parent_ids.len(), rows = rows.len(), failed, "fetched endpoint children");
            batch.children.entry(child.name.clone()).or_default().extend(rows);
        }
    }

    async fn load(
        &self,
        session: &mut dyn LoadSession,
        entity: &EntitySpec,
        region: &RegionCode,
        mut batch: TransformedBatch,
    ) -> Result<LoadStats, SyncError> {
        let schema = self.store.schema();
        let batch_size = self.settings.batch_size;
        let mut stats = LoadStats::default();

        let plan = UpsertPlan::new(schema, entity.table_spec()?);
        stats.counts += upsert_rows(session, &plan, std::mem::take(&mut batch.parents), batch_size).await?;

        let reports = run_fk_passes(session, schema, &self.catalog, entity, region).await?;
        stats.fk_resolved = reports.iter().map(|r| r.resolved).sum();

        for child in &entity.children {
            let rows = batch.children.remove(&child.name).unwrap_or_default();
            if rows.is_empty() {
                continue;
            }
            let parents = session
                .key_map(&entity.table, &entity.external_id.column, region)
                .await?;
            let mut references = KeyMaps::new();
            for reference in &child.references {
                if references.contains_key(&reference.parent) {
                    continue;
                }
                let target = self.catalog.entity(&reference.parent).ok_or_else(|| CatalogError::UnknownEntity {
                    referenced_by: child.name.clone(),
                    name: reference.parent.clone(),
                })?;
                let map = session
                    .key_map(&target.table, &target.external_id.column, region)
                    .await?;
                references.insert(reference.parent.clone(), map);
            }

            let resolution = resolve_children(child, rows, &parents, &references);
            stats.child_dropped += resolution.dropped;
            let plan = UpsertPlan::new(schema, child.table_spec()?);
            let counts = upsert_rows(session, &plan, resolution.ready, batch_size).await?;
            info!(
                child = %child.name,
                inserted = counts.inserted,
                updated = counts.updated,
                dropped = resolution.dropped,
                optional_unresolved = resolution.unresolved_optional,
                "loaded child rows"
            );
            stats.counts += counts;
        }
        Ok(stats)
    }
}
