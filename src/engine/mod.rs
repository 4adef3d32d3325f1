//! Rendering-engine capability consumed by the pool and the strategies.
//!
//! An engine instance is expensive and long-lived; a session (one page) is
//! cheap and is what jobs hold while they load and query a page.

pub mod chromium;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// How long navigation waits before the page counts as loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitPolicy {
    DomContentLoaded,
    Load,
}

/// Result of navigating a session to a URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Navigation {
    pub status: u16,
    pub final_url: String,
}

impl Navigation {
    pub fn is_error_status(&self) -> bool {
        self.status >= 400
    }
}

/// Starts engine instances on demand.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn RenderEngine>>;
}

/// A running engine instance that sessions are carved from.
#[async_trait]
pub trait RenderEngine: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn PageSession>>;
    /// Connectivity of the instance, independent of any page outcome.
    fn is_alive(&self) -> bool;
    async fn close(&self) -> Result<()>;
}

/// An isolated page session.
#[async_trait]
pub trait PageSession: Send + Sync {
    async fn navigate(
        &mut self,
        url: &str,
        wait: WaitPolicy,
        timeout: Duration,
    ) -> Result<Navigation>;
    /// Rendered text of the first element matching `selector`.
    async fn query_text(&self, selector: &str) -> Result<Option<String>>;
    /// Outer HTML of the first element matching `selector`.
    async fn query_html(&self, selector: &str) -> Result<Option<String>>;
    fn is_alive(&self) -> bool;
    async fn close(self: Box<Self>) -> Result<()>;
}
