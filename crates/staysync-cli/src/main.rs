use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use staysync_core::{Catalog, SyncStatus};
use staysync_source::{FixturePageSource, HttpPageSource, HttpSourceConfig, PageSource};
use staysync_sync::{
    build_scheduler, plan_jobs, EngineSettings, JobOutcome, JobRunner, LogReporter, MemoryStore, PgStore, PgSyncLog,
    StatusReporter, SyncConfig, SyncEngine, SyncStore,
};
use tracing::info;

mod logging;

#[derive(Debug, Parser)]
#[command(name = "staysync")]
#[command(about = "Sync property-operations data from the upstream API into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run sync jobs for a region (or `all`) and an entity (or `all`).
    Sync {
        region: String,
        entity: String,
        /// Load into an in-memory store instead of Postgres.
        #[arg(long)]
        dry_run: bool,
        /// Only fetch records changed since the last successful run.
        #[arg(long)]
        incremental: bool,
    },
    /// Print the dependency-ordered job list without running it.
    Plan { region: String, entity: String },
    /// Collapse duplicate natural keys in a table and install its unique constraint.
    Dedup { table: String },
    Migrate,
    /// Run every region on the configured cron schedule until interrupted.
    Schedule,
    /// Load and validate the catalog.
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing("info")?;
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Sync {
            region,
            entity,
            dry_run,
            incremental,
        } => sync(&config, &region, &entity, dry_run, incremental).await,
        Commands::Plan { region, entity } => {
            let catalog = config.load_catalog()?;
            for job in plan_jobs(&catalog, &region, &entity, false)? {
                println!("{} {}", job.region, job.entity);
            }
            Ok(())
        }
        Commands::Dedup { table } => {
            let catalog = config.load_catalog()?;
            let spec = catalog.table_spec(&table)?;
            let store = connect(&config).await?;
            let report = store.deduplicate(&spec).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
            Ok(())
        }
        Commands::Schedule => schedule(&config).await,
        Commands::Validate => {
            let catalog = config.load_catalog()?;
            let order: Vec<&str> = catalog.sync_order()?.iter().map(|e| e.name.as_str()).collect();
            println!(
                "catalog ok: regions={} entities={} order={}",
                catalog.regions.len(),
                catalog.entities.len(),
                order.join(",")
            );
            Ok(())
        }
    }
}

async fn connect(config: &SyncConfig) -> Result<PgStore> {
    let max_connections = u32::try_from(config.max_parallel + 2).unwrap_or(u32::MAX);
    PgStore::connect(&config.database_url, &config.schema, max_connections)
        .await
        .with_context(|| format!("connecting to {}", redact(&config.database_url)))
}

fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => format!("{}://***{}", &url[..scheme], &url[at..]),
        _ => url.to_string(),
    }
}

fn page_source(config: &SyncConfig, catalog: &Catalog) -> Result<Arc<dyn PageSource>> {
    if let Some(dir) = &config.fixtures_dir {
        info!(dir = %dir.display(), "reading pages from fixtures");
        return Ok(Arc::new(FixturePageSource::new(dir)));
    }
    let mut http = HttpSourceConfig::new(&config.api_base_url)
        .with_tokens_from_env(catalog.regions.iter().map(|r| &r.code));
    http.timeout = config.http_timeout();
    http.token_bucket = config.token_bucket();
    Ok(Arc::new(HttpPageSource::new(http)?))
}

async fn runner(config: &SyncConfig, catalog: Catalog, dry_run: bool) -> Result<JobRunner> {
    let source = page_source(config, &catalog)?;
    let (store, reporter): (Arc<dyn SyncStore>, Arc<dyn StatusReporter>) = if dry_run {
        (Arc::new(MemoryStore::new()), Arc::new(LogReporter))
    } else {
        let store = connect(config).await?;
        let log = PgSyncLog::new(store.pool().clone(), &config.schema)?;
        (Arc::new(store), Arc::new(log))
    };
    let engine = SyncEngine::new(Arc::new(catalog), source, store, reporter, EngineSettings::from(config));
    Ok(JobRunner::new(Arc::new(engine), config.max_parallel))
}

async fn sync(config: &SyncConfig, region: &str, entity: &str, dry_run: bool, incremental: bool) -> Result<()> {
    let catalog = config.load_catalog()?;
    let jobs = plan_jobs(&catalog, region, entity, incremental)?;
    let runner = runner(config, catalog, dry_run).await?;

    let outcomes = runner.run_all(jobs).await;
    let mut failed = 0usize;
    for outcome in &outcomes {
        match outcome {
            JobOutcome::Completed(record) => {
                if record.status == SyncStatus::Failed {
                    failed += 1;
                }
                println!(
                    "{} {} {}: processed={} inserted={} updated={} fk_resolved={}{}",
                    record.region,
                    record.entity_type,
                    record.status.as_str(),
                    record.records_processed,
                    record.records_inserted,
                    record.records_updated,
                    record.fk_resolved_count,
                    record
                        .error_message
                        .as_deref()
                        .map(|e| format!(" error={e}"))
                        .unwrap_or_default()
                );
            }
            JobOutcome::Skipped { region, entity } => println!("{region} {entity} skipped: already running"),
        }
    }
    if failed > 0 {
        bail!("{failed} of {} sync jobs failed", outcomes.len());
    }
    Ok(())
}

async fn schedule(config: &SyncConfig) -> Result<()> {
    if !config.scheduler_enabled {
        bail!("scheduler disabled; set STAYSYNC_SCHEDULER_ENABLED=true");
    }
    let catalog = config.load_catalog()?;
    let runner = runner(config, catalog, false).await?;
    let sched = build_scheduler(runner, &config.sync_cron).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.sync_cron, "scheduler running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    Ok(())
}
