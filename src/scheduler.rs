//! Time-driven dispatch of scrape jobs.
//!
//! Three triggers run on their own tasks: an hourly frequency check, a daily
//! full sweep at a configured local time and a run-log retention prune. Every
//! job passes through one counting semaphore, so at most
//! `max_concurrent_scrapers` jobs are ever past dispatch at once.

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::config::Config;
use crate::db::{self, Pool};
use crate::job::{JobReport, JobRunner};
use crate::model::Source;
use crate::pool::{self, PoolStats, ResourcePool};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub max_concurrent: usize,
    pub timezone: Tz,
    pub daily_at: NaiveTime,
    pub log_retention_days: u32,
    pub shutdown_grace: Duration,
    pub maintenance_interval: Duration,
    pub max_idle: Duration,
}

impl SchedulerSettings {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        Ok(Self {
            max_concurrent: cfg.scraper.max_concurrent_scrapers.max(1),
            timezone: cfg.timezone()?,
            daily_at: cfg.daily_scrape_time()?,
            log_retention_days: cfg.scheduler.log_retention_days,
            shutdown_grace: Duration::from_secs(cfg.scheduler.shutdown_grace_secs),
            maintenance_interval: cfg.scraper.maintenance_interval(),
            max_idle: cfg.scraper.max_idle(),
        })
    }
}

/// Counts for one dispatched batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub records_new: usize,
}

impl BatchReport {
    fn absorb(&mut self, report: &JobReport) {
        if report.status.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.records_new += report.records_new;
    }
}

/// A source with frequency `f` is due when the local hour is a multiple of
/// `f`. Zero never fires. Frequencies that do not divide 24 fire unevenly
/// across midnight.
pub fn is_due(hour: u32, frequency_hours: u32) -> bool {
    frequency_hours != 0 && hour % frequency_hours == 0
}

/// Due sources grouped by frequency, in ascending frequency order.
pub fn due_groups(sources: Vec<Source>, hour: u32) -> BTreeMap<u32, Vec<Source>> {
    let mut groups: BTreeMap<u32, Vec<Source>> = BTreeMap::new();
    for source in sources {
        if source.active && is_due(hour, source.scrape_frequency_hours) {
            groups
                .entry(source.scrape_frequency_hours)
                .or_default()
                .push(source);
        }
    }
    groups
}

fn resolve_local(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Start of the next local hour after `now`.
pub fn next_hour_boundary(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local = now.with_timezone(&tz).naive_local();
    let mut candidate = NaiveTime::from_hms_opt(local.hour(), 0, 0)
        .map(|t| local.date().and_time(t))
        .unwrap_or(local);
    for _ in 0..3 {
        candidate += chrono::Duration::hours(1);
        if let Some(at) = resolve_local(tz, candidate) {
            if at > now {
                return at;
            }
        }
    }
    now + chrono::Duration::hours(1)
}

/// Next occurrence of the local wall-clock time `at` strictly after `now`.
pub fn next_daily_run(now: DateTime<Utc>, tz: Tz, at: NaiveTime) -> DateTime<Utc> {
    let mut date = now.with_timezone(&tz).date_naive();
    for _ in 0..3 {
        if let Some(run) = resolve_local(tz, date.and_time(at)) {
            if run > now {
                return run;
            }
        }
        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }
    now + chrono::Duration::days(1)
}

fn until(target: DateTime<Utc>) -> Duration {
    (target - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

struct Inner {
    db: Pool,
    runner: Arc<JobRunner>,
    pool: Arc<ResourcePool>,
    permits: Arc<Semaphore>,
    settings: SchedulerSettings,
    shutdown: watch::Receiver<bool>,
}

impl Inner {
    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn dispatch(&self, sources: Vec<Source>) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        let mut handles = Vec::with_capacity(sources.len());
        for source in sources {
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| anyhow!("scrape semaphore closed"))?;
            if self.stopping() {
                info!("shutdown requested; not dispatching further jobs");
                break;
            }
            let runner = self.runner.clone();
            report.dispatched += 1;
            handles.push(tokio::spawn(async move {
                let result = runner.run(&source).await;
                drop(permit);
                (source.id, result)
            }));
        }

        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok((_, Ok(job))) => report.absorb(&job),
                Ok((source_id, Err(err))) => {
                    error!(source_id, ?err, "scrape job could not be recorded");
                    report.failed += 1;
                }
                Err(err) => {
                    error!(?err, "scrape task panicked");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn tick(&self, now: DateTime<Utc>) -> Result<BatchReport> {
        let hour = now.with_timezone(&self.settings.timezone).hour();
        let sources = db::list_active_sources(&self.db).await?;
        let groups = due_groups(sources, hour);
        if groups.is_empty() {
            return Ok(BatchReport::default());
        }
        for (frequency, group) in &groups {
            info!(hour, frequency, sources = group.len(), "sources due");
        }
        self.dispatch(groups.into_values().flatten().collect()).await
    }

    async fn full_sweep(&self) -> Result<BatchReport> {
        let sources = db::list_active_sources(&self.db).await?;
        info!(sources = sources.len(), "daily sweep");
        self.dispatch(sources).await
    }

    async fn prune(&self) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.settings.log_retention_days));
        db::prune_run_outcomes(&self.db, cutoff).await
    }
}

pub struct Scheduler {
    inner: Arc<Inner>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(db: Pool, pool: Arc<ResourcePool>, runner: Arc<JobRunner>, settings: SchedulerSettings) -> Self {
        let (shutdown_tx, shutdown) = watch::channel(false);
        let inner = Inner {
            db,
            runner,
            pool,
            permits: Arc::new(Semaphore::new(settings.max_concurrent)),
            settings,
            shutdown,
        };
        Self {
            inner: Arc::new(inner),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Run every active source due at `now`'s local hour.
    #[instrument(skip_all, fields(at = %now))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<BatchReport> {
        self.inner.tick(now).await
    }

    /// Run every active source regardless of frequency.
    #[instrument(skip_all)]
    pub async fn full_sweep(&self) -> Result<BatchReport> {
        self.inner.full_sweep().await
    }

    /// Scrape one source immediately, still bounded by the semaphore.
    /// Returns false when the source does not exist or is inactive.
    #[instrument(skip_all, fields(source_id = source_id))]
    pub async fn run_source_now(&self, source_id: i64) -> Result<bool> {
        let Some(source) = db::get_source(&self.inner.db, source_id).await? else {
            warn!("source not found");
            return Ok(false);
        };
        if !source.active {
            warn!("source is inactive");
            return Ok(false);
        }
        let report = self.inner.dispatch(vec![source]).await?;
        Ok(report.dispatched == 1)
    }

    /// Delete run-log rows past the retention window.
    pub async fn prune_run_log(&self) -> Result<u64> {
        self.inner.prune().await
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats().await
    }

    /// Spawn the triggers and pool maintenance.
    pub fn start(&self) {
        let settings = self.inner.settings;
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());

        handles.push(self.spawn_trigger(
            "hourly",
            move |now| next_hour_boundary(now, settings.timezone),
            |inner, at| async move { inner.tick(at).await.map(|_| ()) }.boxed(),
        ));
        handles.push(self.spawn_trigger(
            "daily",
            move |now| next_daily_run(now, settings.timezone, settings.daily_at),
            |inner, _| async move { inner.full_sweep().await.map(|_| ()) }.boxed(),
        ));
        handles.push(self.spawn_trigger(
            "retention",
            |now| now + chrono::Duration::days(1),
            |inner, _| {
                async move {
                    let removed = inner.prune().await?;
                    info!(removed, "pruned run log");
                    Ok(())
                }
                .boxed()
            },
        ));
        handles.push(pool::spawn_maintenance(
            self.inner.pool.clone(),
            settings.maintenance_interval,
            settings.max_idle,
            self.inner.shutdown.clone(),
        ));
        info!(
            timezone = %settings.timezone,
            daily_at = %settings.daily_at.format("%H:%M"),
            max_concurrent = settings.max_concurrent,
            "scheduler started"
        );
    }

    fn spawn_trigger<N, F>(&self, name: &'static str, next: N, fire: F) -> JoinHandle<()>
    where
        N: Fn(DateTime<Utc>) -> DateTime<Utc> + Send + 'static,
        F: Fn(Arc<Inner>, DateTime<Utc>) -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        let inner = self.inner.clone();
        let mut shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let at = next(Utc::now());
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(until(at)) => {}
                }
                if inner.stopping() {
                    break;
                }
                if let Err(err) = fire(inner.clone(), at).await {
                    error!(trigger = name, ?err, "scheduled run failed");
                }
            }
            info!(trigger = name, "trigger stopped");
        })
    }

    /// Stop triggers, let in-flight jobs finish within the grace period,
    /// then close the resource pool.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let settings = self.inner.settings;
        let all = u32::try_from(settings.max_concurrent).unwrap_or(u32::MAX);
        match tokio::time::timeout(settings.shutdown_grace, self.inner.permits.acquire_many(all)).await {
            Ok(Ok(_permits)) => info!("in-flight jobs finished"),
            Ok(Err(_)) => {}
            Err(_) => warn!(
                grace_secs = settings.shutdown_grace.as_secs(),
                "in-flight jobs still running after grace period"
            ),
        }

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }
        self.inner.pool.shutdown().await;
        info!("scheduler stopped");
    }
}
