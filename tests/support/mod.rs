#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use tender_scout::db::{self, Pool};
use tender_scout::engine::{EngineLauncher, Navigation, PageSession, RenderEngine, WaitPolicy};
use tender_scout::inference::{CompletionService, Inference, RetryPolicy};
use tender_scout::job::{JobRunner, JobSettings};
use tender_scout::model::{ExtractionHints, NewSource, PageType};
use tender_scout::pool::{PoolConfig, ResourcePool};

#[derive(Clone)]
pub struct Page {
    pub status: u16,
    pub html: String,
    pub delay: Duration,
}

impl Page {
    pub fn ok(html: impl Into<String>) -> Self {
        Self {
            status: 200,
            html: html.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Serves canned pages by URL and records how many navigations overlap.
#[derive(Default)]
pub struct Site {
    pages: Mutex<HashMap<String, Page>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub navigations: AtomicUsize,
    pub launches: AtomicUsize,
}

impl Site {
    pub fn serve(&self, url: &str, page: Page) {
        self.pages.lock().unwrap().insert(url.to_string(), page);
    }

    pub fn peak(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

pub struct FakeLauncher {
    pub site: Arc<Site>,
}

#[async_trait]
impl EngineLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Arc<dyn RenderEngine>> {
        self.site.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeEngine {
            site: self.site.clone(),
            alive: Arc::new(AtomicBool::new(true)),
        }))
    }
}

struct FakeEngine {
    site: Arc<Site>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl RenderEngine for FakeEngine {
    async fn open_session(&self) -> Result<Box<dyn PageSession>> {
        Ok(Box::new(FakeSession {
            site: self.site.clone(),
            alive: self.alive.clone(),
            html: None,
        }))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeSession {
    site: Arc<Site>,
    alive: Arc<AtomicBool>,
    html: Option<String>,
}

fn select_first(html: &str, selector: &str, outer: bool) -> Result<Option<String>> {
    let selector = Selector::parse(selector).map_err(|e| anyhow!("bad selector: {e:?}"))?;
    let doc = Html::parse_document(html);
    let found = doc.select(&selector).next().map(|el| {
        if outer {
            el.html()
        } else {
            el.text().collect::<Vec<_>>().join(" ")
        }
    });
    Ok(found)
}

#[async_trait]
impl PageSession for FakeSession {
    async fn navigate(&mut self, url: &str, _: WaitPolicy, _: Duration) -> Result<Navigation> {
        let page = self
            .site
            .pages
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("net::ERR_NAME_NOT_RESOLVED at {url}"))?;
        self.site.navigations.fetch_add(1, Ordering::SeqCst);
        let now = self.site.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.site.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(page.delay).await;
        self.site.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.html = Some(page.html);
        Ok(Navigation {
            status: page.status,
            final_url: url.to_string(),
        })
    }

    async fn query_text(&self, selector: &str) -> Result<Option<String>> {
        match &self.html {
            Some(html) => select_first(html, selector, false),
            None => Ok(None),
        }
    }

    async fn query_html(&self, selector: &str) -> Result<Option<String>> {
        match &self.html {
            Some(html) => select_first(html, selector, true),
            None => Ok(None),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Replays scripted completions; once exhausted every call fails.
#[derive(Default)]
pub struct ScriptedCompletions {
    replies: Mutex<VecDeque<Result<String>>>,
    pub calls: AtomicUsize,
}

impl ScriptedCompletions {
    pub fn new(replies: Vec<Result<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletions {
    async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("connection refused")))
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(vec!["llama2".into()])
    }
}

pub struct Harness {
    pub db: Pool,
    pub site: Arc<Site>,
    pub pool: Arc<ResourcePool>,
    pub runner: Arc<JobRunner>,
    pub inference: Inference,
    pub completions: Arc<ScriptedCompletions>,
    _dir: TempDir,
}

impl Harness {
    /// A second runner over the same pool and database with other limits.
    pub fn runner_with(&self, settings: JobSettings) -> JobRunner {
        JobRunner::new(self.pool.clone(), self.db.clone(), self.inference.clone(), settings)
    }
}

pub fn job_settings() -> JobSettings {
    JobSettings {
        acquire_timeout: Duration::from_secs(5),
        page_timeout: Duration::from_secs(5),
        job_timeout: Duration::from_secs(10),
        wait: WaitPolicy::Load,
        timezone: chrono_tz::Asia::Kolkata,
    }
}

pub async fn setup_db() -> (Pool, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}/scout.db", dir.path().display());
    let db = db::init_pool(&url).await.unwrap();
    db::run_migrations(&db).await.unwrap();
    (db, dir)
}

pub async fn harness(completions: Vec<Result<String>>) -> Harness {
    harness_with(completions, 4, 2).await
}

pub async fn harness_with(completions: Vec<Result<String>>, max_instances: usize, per_instance: usize) -> Harness {
    let (db, dir) = setup_db().await;
    let site = Arc::new(Site::default());
    let pool = ResourcePool::new(
        Arc::new(FakeLauncher { site: site.clone() }),
        PoolConfig {
            max_instances,
            contexts_per_instance: per_instance,
            acquire_timeout: Duration::from_secs(5),
        },
    );
    let completions = Arc::new(ScriptedCompletions::new(completions));
    let inference = Inference::new(
        completions.clone(),
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            attempt_timeout: Duration::from_secs(2),
        },
    );
    let runner = Arc::new(JobRunner::new(
        pool.clone(),
        db.clone(),
        inference.clone(),
        job_settings(),
    ));
    Harness {
        db,
        site,
        pool,
        runner,
        inference,
        completions,
        _dir: dir,
    }
}

pub async fn add_source(db: &Pool, url: &str, page_type: PageType, frequency_hours: u32) -> i64 {
    db::create_source(
        db,
        &NewSource {
            name: url.to_string(),
            url: url.to_string(),
            page_type,
            scrape_frequency_hours: frequency_hours,
            hints: ExtractionHints::default(),
            notes: None,
        },
    )
    .await
    .unwrap()
}

pub fn table_page(rows: &[[&str; 4]]) -> String {
    let body: String = rows
        .iter()
        .map(|r| {
            format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                r[0], r[1], r[2], r[3]
            )
        })
        .collect();
    format!(
        "<html><body><table>\
         <tr><th>Advertisement</th><th>Location</th><th>Date of Advertisement</th><th>Last Date</th></tr>\
         {body}</table></body></html>"
    )
}
