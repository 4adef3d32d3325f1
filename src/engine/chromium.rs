//! Headless Chromium engine driven over CDP with chromiumoxide.

use super::{EngineLauncher, Navigation, PageSession, RenderEngine, WaitPolicy};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config;

const LAUNCH_ARGS: &[&str] = &[
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--disable-gpu",
    "--disable-background-timer-throttling",
    "--disable-backgrounding-occluded-windows",
    "--disable-renderer-backgrounding",
    "--disable-extensions",
    "--no-first-run",
    "--no-default-browser-check",
];

/// Locate a Chromium binary: explicit path, `CHROME_BIN`, then `PATH`.
pub fn find_chromium(explicit: Option<&str>) -> Option<PathBuf> {
    if let Some(p) = explicit.map(PathBuf::from).filter(|p| p.exists()) {
        return Some(p);
    }
    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }
    ["chromium", "chromium-browser", "google-chrome", "google-chrome-stable"]
        .iter()
        .find_map(|name| which::which(name).ok())
}

/// Launches one headless Chromium process per engine instance.
#[derive(Debug, Clone)]
pub struct ChromiumLauncher {
    executable: Option<PathBuf>,
    headless: bool,
    user_agent: Option<String>,
}

impl ChromiumLauncher {
    pub fn from_config(cfg: &config::Scraper) -> Self {
        Self {
            executable: find_chromium(cfg.chromium_path.as_deref()),
            headless: cfg.headless,
            user_agent: cfg.user_agent.clone(),
        }
    }
}

#[async_trait]
impl EngineLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Arc<dyn RenderEngine>> {
        let executable = self
            .executable
            .clone()
            .context("Chromium not found; set scraper.chromium_path or CHROME_BIN")?;

        let mut builder = BrowserConfig::builder().chrome_executable(executable);
        if !self.headless {
            builder = builder.with_head();
        }
        for arg in LAUNCH_ARGS {
            builder = builder.arg(*arg);
        }
        if let Some(ua) = &self.user_agent {
            builder = builder.arg(format!("--user-agent={ua}"));
        }
        let config = builder
            .build()
            .map_err(|e| anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch Chromium")?;

        let alive = Arc::new(AtomicBool::new(true));
        let handler_alive = Arc::clone(&alive);
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(%err, "chromium handler event error");
                }
            }
            handler_alive.store(false, Ordering::SeqCst);
            warn!("chromium connection closed");
        });

        Ok(Arc::new(ChromiumEngine {
            browser: Mutex::new(Some(browser)),
            alive,
        }))
    }
}

pub struct ChromiumEngine {
    browser: Mutex<Option<Browser>>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl RenderEngine for ChromiumEngine {
    async fn open_session(&self) -> Result<Box<dyn PageSession>> {
        let guard = self.browser.lock().await;
        let browser = guard.as_ref().context("browser already closed")?;
        let page = browser
            .new_page("about:blank")
            .await
            .context("failed to create new page")?;
        Ok(Box::new(ChromiumSession {
            page,
            alive: Arc::clone(&self.alive),
        }))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.browser.lock().await;
        if let Some(mut browser) = guard.take() {
            if let Err(err) = browser.close().await {
                debug!(%err, "chromium close returned error");
            }
        }
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub struct ChromiumSession {
    page: Page,
    alive: Arc<AtomicBool>,
}

#[derive(Deserialize)]
struct Lookup {
    found: bool,
    value: String,
}

impl ChromiumSession {
    async fn lookup(&self, selector: &str, property: &str) -> Result<Option<String>> {
        let selector = serde_json::to_string(selector)?;
        let script = format!(
            "(() => {{ const el = document.querySelector({selector}); \
             return el ? {{ found: true, value: el.{property} || '' }} : {{ found: false, value: '' }}; }})()"
        );
        let result = self
            .page
            .evaluate(script)
            .await
            .context("selector lookup failed")?;
        let lookup: Lookup = result
            .into_value()
            .map_err(|e| anyhow!("failed to convert lookup result: {e:?}"))?;
        Ok(lookup.found.then_some(lookup.value))
    }

    async fn response_status(&self) -> u16 {
        let script = "(() => { const e = performance.getEntriesByType('navigation')[0]; \
                      return e && e.responseStatus ? e.responseStatus : 200; })()";
        match self.page.evaluate(script).await {
            Ok(v) => v.into_value::<u16>().unwrap_or(200),
            Err(_) => 200,
        }
    }
}

#[async_trait]
impl PageSession for ChromiumSession {
    async fn navigate(
        &mut self,
        url: &str,
        wait: WaitPolicy,
        timeout: Duration,
    ) -> Result<Navigation> {
        self.page
            .goto(url)
            .await
            .with_context(|| format!("navigation to {url} failed"))?;

        if wait == WaitPolicy::Load {
            // Bounded; a page that never settles is still queried.
            let _ = tokio::time::timeout(timeout, self.page.wait_for_navigation()).await;
        }

        let final_url = self
            .page
            .url()
            .await
            .ok()
            .flatten()
            .map(|u| u.to_string())
            .unwrap_or_else(|| url.to_string());

        Ok(Navigation {
            status: self.response_status().await,
            final_url,
        })
    }

    async fn query_text(&self, selector: &str) -> Result<Option<String>> {
        self.lookup(selector, "innerText").await
    }

    async fn query_html(&self, selector: &str) -> Result<Option<String>> {
        self.lookup(selector, "outerHTML").await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let _ = self.page.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_must_exist() {
        let td = tempfile::tempdir().unwrap();
        let fake = td.path().join("chrome");
        std::fs::write(&fake, b"").unwrap();
        assert_eq!(
            find_chromium(Some(fake.to_str().unwrap())),
            Some(fake.clone())
        );
    }

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn chromium_navigate_and_query() {
        let cfg: config::Config = serde_yaml::from_str(config::example()).unwrap();
        let launcher = ChromiumLauncher::from_config(&cfg.scraper);
        let engine = launcher.launch().await.expect("launch");
        let mut session = engine.open_session().await.expect("session");

        let nav = session
            .navigate(
                "data:text/html,<table><tr><th>Title</th></tr><tr><td>Hello</td></tr></table>",
                WaitPolicy::Load,
                Duration::from_secs(10),
            )
            .await
            .expect("navigate");
        assert!(!nav.is_error_status());

        let html = session.query_html("table").await.unwrap().unwrap();
        assert!(html.contains("Hello"));
        assert_eq!(session.query_text("#missing").await.unwrap(), None);

        session.close().await.unwrap();
        engine.close().await.unwrap();
        assert!(!engine.is_alive());
    }
}
