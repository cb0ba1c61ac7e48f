//! Job orchestration: regions in parallel, each region's entity chain in
//! dependency order, and at most one run per (region, entity) at a time.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use staysync_core::{RegionCode, SyncStatus, SyncStatusRecord};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::pipeline::{plan_jobs, SyncEngine, SyncJob};

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(SyncStatusRecord),
    /// The same (region, entity) was already running.
    Skipped { region: RegionCode, entity: String },
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, JobOutcome::Completed(record) if record.status == SyncStatus::Success)
    }
}

type InFlight = Arc<Mutex<HashSet<(RegionCode, String)>>>;

struct InFlightGuard {
    set: InFlight,
    key: (RegionCode, String),
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.key);
        }
    }
}

#[derive(Clone)]
pub struct JobRunner {
    engine: Arc<SyncEngine>,
    permits: Arc<Semaphore>,
    in_flight: InFlight,
}

impl JobRunner {
    pub fn new(engine: Arc<SyncEngine>, max_parallel: usize) -> Self {
        Self {
            engine,
            permits: Arc::new(Semaphore::new(max_parallel.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    fn claim(&self, job: &SyncJob) -> Option<InFlightGuard> {
        let key = (job.region.clone(), job.entity.clone());
        let mut set = self.in_flight.lock().ok()?;
        if !set.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            set: self.in_flight.clone(),
            key,
        })
    }

    pub async fn run_job(&self, job: &SyncJob) -> JobOutcome {
        let Some(_guard) = self.claim(job) else {
            warn!(region = %job.region, entity = %job.entity, "job already running; skipping");
            return JobOutcome::Skipped {
                region: job.region.clone(),
                entity: job.entity.clone(),
            };
        };
        JobOutcome::Completed(self.engine.run(job).await)
    }

    /// Runs one region's jobs in order under a single parallelism permit.
    /// A failed entity does not stop the chain; the next run retries it.
    pub async fn run_region(&self, jobs: Vec<SyncJob>) -> Vec<JobOutcome> {
        let _permit = self.permits.acquire().await.expect("semaphore not closed");
        let mut outcomes = Vec::with_capacity(jobs.len());
        for job in &jobs {
            outcomes.push(self.run_job(job).await);
        }
        outcomes
    }

    /// Groups jobs by region and runs the regions concurrently. Outcomes come
    /// back in the order the jobs were given.
    pub async fn run_all(&self, jobs: Vec<SyncJob>) -> Vec<JobOutcome> {
        let mut regions: Vec<(RegionCode, Vec<(usize, SyncJob)>)> = Vec::new();
        for (idx, job) in jobs.into_iter().enumerate() {
            match regions.iter_mut().find(|(code, _)| *code == job.region) {
                Some((_, chain)) => chain.push((idx, job)),
                None => regions.push((job.region.clone(), vec![(idx, job)])),
            }
        }

        let total: usize = regions.iter().map(|(_, chain)| chain.len()).sum();
        let mut set = JoinSet::new();
        for (region, chain) in regions {
            let runner = self.clone();
            set.spawn(async move {
                let (indexes, jobs): (Vec<usize>, Vec<SyncJob>) = chain.into_iter().unzip();
                let outcomes = runner.run_region(jobs).await;
                info!(%region, jobs = outcomes.len(), ok = outcomes.iter().filter(|o| o.succeeded()).count(), "region finished");
                indexes.into_iter().zip(outcomes).collect::<Vec<_>>()
            });
        }

        let mut slots: Vec<Option<JobOutcome>> = vec![None; total];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(results) => {
                    for (idx, outcome) in results {
                        slots[idx] = Some(outcome);
                    }
                }
                Err(err) => error!(error = %err, "region task panicked"),
            }
        }
        slots.into_iter().flatten().collect()
    }
}

/// One cron job per region; each tick runs that region's full chain
/// incrementally. Ticks that overlap a running chain skip the busy pairs.
pub async fn build_scheduler(runner: JobRunner, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let regions: Vec<RegionCode> = runner.engine().catalog().regions.iter().map(|r| r.code.clone()).collect();
    for region in regions {
        let jobs = plan_jobs(runner.engine().catalog(), region.as_str(), "all", true)
            .with_context(|| format!("planning jobs for {region}"))?;
        let runner = runner.clone();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let runner = runner.clone();
            let jobs = jobs.clone();
            Box::pin(async move {
                let outcomes = runner.run_region(jobs).await;
                let failed = outcomes
                    .iter()
                    .filter(|o| matches!(o, JobOutcome::Completed(r) if r.status == SyncStatus::Failed))
                    .count();
                info!(jobs = outcomes.len(), failed, "scheduled region run finished");
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(sched)
}
