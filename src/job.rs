//! One scrape attempt for one source.
//!
//! Steps run strictly in order: acquire a context, navigate, validate the
//! page structure, extract, release the context, ingest, record the outcome.
//! Whatever happens, the attempt ends with exactly one run-outcome row.

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::db::{NewRunOutcome, Pool};
use crate::engine::{PageSession, WaitPolicy};
use crate::error::ScrapeError;
use crate::gateway::{self, IngestSummary};
use crate::inference::Inference;
use crate::model::{PageType, RunStatus, Source};
use crate::pool::ResourcePool;
use crate::strategy::{ExtractContext, Extraction, Strategy};

#[derive(Debug, Clone, Copy)]
pub struct JobSettings {
    pub acquire_timeout: Duration,
    pub page_timeout: Duration,
    pub job_timeout: Duration,
    pub wait: WaitPolicy,
    pub timezone: Tz,
}

impl JobSettings {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        Ok(Self {
            acquire_timeout: cfg.scraper.acquire_timeout(),
            page_timeout: cfg.scraper.page_timeout(),
            job_timeout: cfg.scraper.job_timeout(),
            wait: WaitPolicy::Load,
            timezone: cfg.timezone()?,
        })
    }
}

/// Summary of one attempt, mirroring the recorded run outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub source_id: i64,
    pub status: RunStatus,
    pub records_found: usize,
    pub records_new: usize,
    pub error: Option<String>,
    pub duration_ms: u64,
}

struct Attempt {
    extraction: Extraction,
    ingested: IngestSummary,
}

pub struct JobRunner {
    pool: Arc<ResourcePool>,
    db: Pool,
    inference: Inference,
    settings: JobSettings,
}

impl JobRunner {
    pub fn new(pool: Arc<ResourcePool>, db: Pool, inference: Inference, settings: JobSettings) -> Self {
        Self {
            pool,
            db,
            inference,
            settings,
        }
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.settings.timezone).date_naive()
    }

    #[instrument(skip_all, fields(source_id = source.id, page_type = source.page_type.as_str()))]
    pub async fn run(&self, source: &Source) -> Result<JobReport> {
        let ran_at = Utc::now();
        let started = Instant::now();
        let attempt = self.attempt(source).await;
        let duration = started.elapsed();

        let (status, error, found, stored, payload) = match &attempt {
            Ok(Attempt { extraction, ingested }) => {
                let (status, error) = classify(extraction);
                (
                    status,
                    error,
                    extraction.candidates.len(),
                    ingested.stored,
                    extraction.payload_bytes,
                )
            }
            Err(err) => (err.run_status(), Some(err.to_string()), 0, 0, 0),
        };

        let outcome = NewRunOutcome {
            source_id: source.id,
            ran_at,
            status,
            records_found: found as i64,
            records_new: stored as i64,
            error_detail: error.clone(),
            duration_ms: duration.as_millis() as i64,
            payload_bytes: payload as i64,
        };
        gateway::record_outcome(&self.db, &outcome).await?;

        if status.is_success() {
            info!(status = status.as_str(), records_found = found, records_new = stored, "scrape finished");
        } else {
            warn!(status = status.as_str(), error = error.as_deref().unwrap_or(""), "scrape failed");
        }

        Ok(JobReport {
            source_id: source.id,
            status,
            records_found: found,
            records_new: stored,
            error,
            duration_ms: duration.as_millis() as u64,
        })
    }

    /// Load `url` in a pooled context and ask the inference service which
    /// strategy fits it. Falls back to `Generic` when classification fails.
    #[instrument(skip_all, fields(url = url))]
    pub async fn probe_page_type(&self, url: &str) -> Result<PageType> {
        let mut ctx = self.pool.acquire(self.settings.acquire_timeout).await?;
        let page_timeout = self.settings.page_timeout;
        let fetched = async {
            let nav = tokio::time::timeout(
                page_timeout,
                ctx.session_mut().navigate(url, self.settings.wait, page_timeout),
            )
            .await
            .map_err(|_| ScrapeError::PageTimeout(page_timeout))?
            .map_err(|e| ScrapeError::Navigation(format!("{e:#}")))?;
            if nav.is_error_status() {
                return Err(ScrapeError::Navigation(format!("HTTP {}", nav.status)));
            }
            ctx.session()
                .query_text("body")
                .await
                .map_err(|e| ScrapeError::Engine(format!("{e:#}")))
        }
        .await;
        let healthy = fetched.as_ref().map_or_else(|e| e.context_reusable(), |_| true)
            && ctx.session().is_alive();
        self.pool.release(ctx, healthy).await;

        let text = fetched?.unwrap_or_default();
        let page_type = self.inference.classify_page(&text).await;
        info!(page_type = page_type.as_str(), "classified page");
        Ok(page_type)
    }

    async fn attempt(&self, source: &Source) -> Result<Attempt, ScrapeError> {
        let mut ctx = self.pool.acquire(self.settings.acquire_timeout).await?;

        let work = tokio::time::timeout(self.settings.job_timeout, self.drive(ctx.session_mut(), source)).await;
        let (result, reusable) = match work {
            Ok(Ok(extraction)) => (Ok(extraction), true),
            Ok(Err(err)) => {
                let reusable = err.context_reusable();
                (Err(err), reusable)
            }
            Err(_) => (Err(ScrapeError::JobTimeout(self.settings.job_timeout)), false),
        };
        let healthy = reusable && ctx.session().is_alive();
        self.pool.release(ctx, healthy).await;

        let extraction = result?;
        let ingested = gateway::ingest(&self.db, source.id, &extraction.candidates)
            .await
            .map_err(ScrapeError::Persistence)?;
        Ok(Attempt {
            extraction,
            ingested,
        })
    }

    async fn drive(&self, session: &mut dyn PageSession, source: &Source) -> Result<Extraction, ScrapeError> {
        let page_timeout = self.settings.page_timeout;
        let nav = tokio::time::timeout(
            page_timeout,
            session.navigate(&source.url, self.settings.wait, page_timeout),
        )
        .await
        .map_err(|_| ScrapeError::PageTimeout(page_timeout))?
        .map_err(|e| ScrapeError::Navigation(format!("{e:#}")))?;
        if nav.is_error_status() {
            return Err(ScrapeError::Navigation(format!(
                "HTTP {} from {}",
                nav.status, nav.final_url
            )));
        }

        let strategy = Strategy::for_page_type(source.page_type);
        let session: &dyn PageSession = session;
        if !strategy.validate_structure(session, &source.hints).await? {
            return Err(ScrapeError::StructureInvalid(format!(
                "expected {} layout not found",
                strategy.name()
            )));
        }

        let cx = ExtractContext {
            inference: &self.inference,
            today: self.today(),
        };
        strategy.extract(session, source, &cx).await
    }
}

/// Status of an attempt that got as far as extraction.
fn classify(extraction: &Extraction) -> (RunStatus, Option<String>) {
    match &extraction.degraded {
        Some(err) if err.is_timeout() => (RunStatus::Timeout, Some(err.to_string())),
        Some(err) => (RunStatus::Partial, Some(err.to_string())),
        None if extraction.dropped > 0 => (
            RunStatus::Partial,
            Some(format!("{} extracted items failed validation", extraction.dropped)),
        ),
        None => (RunStatus::Success, None),
    }
}
