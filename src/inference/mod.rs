//! Fallback to an external completion service: prompt construction, bounded
//! retry at the network layer, and schema enforcement on what comes back.

pub mod ollama;
pub mod prompts;
pub mod schema;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config;
use crate::model::PageType;
pub use prompts::{PromptKind, PromptRequest};

/// Text shorter than this is not worth a completion call.
pub const MIN_CONTENT_CHARS: usize = 50;
/// Classification only looks at the head of the page.
pub const CLASSIFY_SAMPLE_CHARS: usize = 2000;

const NOTIFICATION_FIELDS: &[&str] = &[
    "title",
    "tender_id",
    "location",
    "category",
    "start_date",
    "end_date",
    "additional_info",
];

static ISO_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("iso date regex"));

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference service unavailable after {attempts} attempts: {last_error}")]
    Unavailable {
        attempts: u32,
        timed_out: bool,
        last_error: String,
    },
    #[error("malformed inference response: {0}")]
    Malformed(String),
    #[error("inference response violates schema at {path}: {reason}")]
    SchemaViolation { path: String, reason: String },
}

impl InferenceError {
    /// The final attempt hit the per-attempt deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, InferenceError::Unavailable { timed_out: true, .. })
    }
}

/// Raw structured-completion capability.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
    async fn list_models(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &config::Inference) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            base_delay: cfg.retry_base_delay(),
            attempt_timeout: cfg.request_timeout(),
        }
    }

    /// Wait after the given failed attempt (1-based): base x 2^(attempt-1).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

/// A successful network-layer call and the backoff waits it took to get there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub backoffs: Vec<Duration>,
}

/// Validated notification items from one extraction call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationBatch {
    pub items: Vec<Map<String, Value>>,
    pub dropped: usize,
}

#[derive(Clone)]
pub struct Inference {
    service: Arc<dyn CompletionService>,
    policy: RetryPolicy,
}

impl Inference {
    pub fn new(service: Arc<dyn CompletionService>, policy: RetryPolicy) -> Self {
        Self { service, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Network layer: bounded attempts with exponential backoff, each attempt
    /// under its own deadline.
    #[instrument(skip_all)]
    pub async fn complete_raw(&self, system: &str, prompt: &str) -> Result<Completion, InferenceError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut backoffs = Vec::new();
        let mut last_error = String::new();
        let mut timed_out = false;

        for attempt in 1..=max_attempts {
            let call = self.service.complete(system, prompt);
            match tokio::time::timeout(self.policy.attempt_timeout, call).await {
                Ok(Ok(text)) => return Ok(Completion { text, backoffs }),
                Ok(Err(err)) => {
                    timed_out = false;
                    last_error = format!("{err:#}");
                }
                Err(_) => {
                    timed_out = true;
                    last_error = format!("timed out after {:?}", self.policy.attempt_timeout);
                }
            }
            warn!(attempt, max_attempts, error = %last_error, "inference attempt failed");
            if attempt < max_attempts {
                let delay = self.policy.delay_after(attempt);
                backoffs.push(delay);
                tokio::time::sleep(delay).await;
            }
        }

        Err(InferenceError::Unavailable {
            attempts: max_attempts,
            timed_out,
            last_error,
        })
    }

    /// Both layers: call, then coerce and check against the prompt's schema.
    pub async fn complete(&self, request: &PromptRequest<'_>) -> Result<Value, InferenceError> {
        let rendered = request.render();
        let completion = self.complete_raw(rendered.system, &rendered.prompt).await?;
        let value = schema::parse_response(&completion.text)?;
        rendered.schema.check(&value)?;
        debug!(kind = rendered.kind.as_str(), "inference response accepted");
        Ok(value)
    }

    /// Structured notifications from free text. Items failing validation are
    /// counted and dropped.
    #[instrument(skip_all, fields(chars = content.len()))]
    pub async fn extract_notifications(&self, content: &str) -> Result<NotificationBatch, InferenceError> {
        if content.trim().chars().count() < MIN_CONTENT_CHARS {
            warn!("content too short for inference");
            return Ok(NotificationBatch::default());
        }
        let value = self
            .complete(&PromptRequest::ExtractNotifications { text: content })
            .await?;

        let mut batch = NotificationBatch::default();
        let items = value
            .get("notifications")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for item in items {
            match validate_notification(&item) {
                Ok(valid) => batch.items.push(valid),
                Err(reason) => {
                    warn!(%reason, "skipping invalid notification");
                    batch.dropped += 1;
                }
            }
        }
        Ok(batch)
    }

    /// Page-type guess. Anything unexpected collapses to generic.
    pub async fn classify_page(&self, content: &str) -> PageType {
        let sample: String = content.chars().take(CLASSIFY_SAMPLE_CHARS).collect();
        match self.complete(&PromptRequest::ClassifyPage { text: &sample }).await {
            Ok(value) => value
                .get("type")
                .and_then(Value::as_str)
                .and_then(|t| PageType::parse(t.trim()))
                .unwrap_or(PageType::Generic),
            Err(err) => {
                warn!(%err, "page classification failed");
                PageType::Generic
            }
        }
    }

    pub async fn parse_date(&self, raw: &str, today: NaiveDate) -> Option<NaiveDate> {
        let value = match self.complete(&PromptRequest::ParseDate { raw, today }).await {
            Ok(value) => value,
            Err(err) => {
                warn!(%err, raw, "date normalisation failed");
                return None;
            }
        };
        value
            .get("date")
            .and_then(Value::as_str)
            .filter(|s| ISO_DATE.is_match(s))
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
    }

    pub async fn extract_location(&self, text: &str) -> Option<String> {
        match self.complete(&PromptRequest::ExtractLocation { text }).await {
            Ok(value) => value
                .get("location")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            Err(err) => {
                warn!(%err, "location extraction failed");
                None
            }
        }
    }
}

/// Keep known keys of one returned item. Title (or description) is required;
/// dates, when present, must be `YYYY-MM-DD`.
pub fn validate_notification(item: &Value) -> Result<Map<String, Value>, String> {
    let obj = item.as_object().ok_or("item is not an object")?;

    let non_empty = |key: &str| {
        obj.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let title = non_empty("title")
        .or_else(|| non_empty("description"))
        .ok_or("missing required field: title")?;

    for key in ["start_date", "end_date"] {
        match obj.get(key) {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) if s.is_empty() => {}
            Some(Value::String(s)) => {
                if !ISO_DATE.is_match(s) || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_err() {
                    return Err(format!("invalid {key}: {s}"));
                }
            }
            Some(other) => return Err(format!("invalid {key}: {other}")),
        }
    }

    let mut out: Map<String, Value> = obj
        .iter()
        .filter(|(k, _)| NOTIFICATION_FIELDS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    out.insert("title".into(), Value::String(title));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays scripted replies; an exhausted script answers with an error.
    #[derive(Default)]
    struct ScriptedService {
        replies: Mutex<VecDeque<Result<String>>>,
        calls: AtomicUsize,
        hang: bool,
    }

    impl ScriptedService {
        fn new(replies: Vec<Result<String>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl CompletionService for ScriptedService {
        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                futures::future::pending::<()>().await;
            }
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("no scripted reply")))
        }
        async fn list_models(&self) -> Result<Vec<String>> {
            Ok(vec!["llama2".into()])
        }
    }

    fn inference(service: Arc<ScriptedService>) -> Inference {
        Inference::new(
            service,
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(100),
                attempt_timeout: Duration::from_secs(5),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt_after_two_backoffs() {
        let service = Arc::new(ScriptedService::new(vec![
            Err(anyhow!("connection refused")),
            Err(anyhow!("502")),
            Ok("{\"type\": \"table\"}".into()),
        ]));
        let completion = inference(service.clone())
            .complete_raw("sys", "prompt")
            .await
            .unwrap();
        assert_eq!(completion.text, "{\"type\": \"table\"}");
        assert_eq!(
            completion.backoffs,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert_eq!(service.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn three_failures_make_the_service_unavailable() {
        let service = Arc::new(ScriptedService::new(vec![
            Err(anyhow!("a")),
            Err(anyhow!("b")),
            Err(anyhow!("c")),
            Ok("never reached".into()),
        ]));
        let err = inference(service.clone())
            .complete_raw("sys", "prompt")
            .await
            .unwrap_err();
        match err {
            InferenceError::Unavailable {
                attempts,
                timed_out,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(!timed_out);
                assert_eq!(last_error, "c");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(service.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_service_reports_timeout() {
        let service = Arc::new(ScriptedService {
            hang: true,
            ..Default::default()
        });
        let err = inference(service).complete_raw("s", "p").await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn malformed_reply_is_not_retried() {
        let service = Arc::new(ScriptedService::new(vec![Ok("I cannot help with that".into())]));
        let err = inference(service.clone())
            .complete(&PromptRequest::ExtractLocation { text: "x" })
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Malformed(_)));
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn extraction_drops_invalid_items() {
        let reply = json!({"notifications": [
            {"title": "Supply of laptops", "tender_id": "T-1", "location": null, "category": null,
             "start_date": "2025-06-01", "end_date": null, "confidence": 0.9},
            {"title": "", "tender_id": null, "location": null, "category": null,
             "start_date": null, "end_date": null},
            {"title": "Bad date", "tender_id": null, "location": null, "category": null,
             "start_date": "01/06/2025", "end_date": null}
        ]});
        let service = Arc::new(ScriptedService::new(vec![Ok(format!(
            "```json\n{reply}\n```"
        ))]));
        let text = "Tender notice: supply of laptops for the district office. Last date 30-06-2025.";
        let batch = inference(service).extract_notifications(text).await.unwrap();
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.dropped, 2);
        assert_eq!(batch.items[0]["title"], "Supply of laptops");
        assert!(!batch.items[0].contains_key("confidence"));
    }

    #[tokio::test]
    async fn short_content_skips_the_service() {
        let service = Arc::new(ScriptedService::default());
        let batch = inference(service.clone())
            .extract_notifications("too short")
            .await
            .unwrap();
        assert!(batch.items.is_empty());
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn classification_outside_allow_list_is_generic() {
        let service = Arc::new(ScriptedService::new(vec![
            Ok("{\"type\": \"Table\"}".into()),
            Ok("{\"type\": \"carousel\"}".into()),
        ]));
        let inf = inference(service);
        assert_eq!(inf.classify_page("<table>").await, PageType::Table);
        assert_eq!(inf.classify_page("<div>").await, PageType::Generic);
    }

    #[tokio::test]
    async fn parse_date_rejects_non_iso_answers() {
        let service = Arc::new(ScriptedService::new(vec![
            Ok("{\"date\": \"2025-07-04\"}".into()),
            Ok("{\"date\": \"July 4\"}".into()),
        ]));
        let inf = inference(service);
        let today = NaiveDate::from_ymd_opt(2025, 7, 1).unwrap();
        assert_eq!(
            inf.parse_date("this Friday", today).await,
            NaiveDate::from_ymd_opt(2025, 7, 4)
        );
        assert_eq!(inf.parse_date("July 4", today).await, None);
    }

    #[test]
    fn description_stands_in_for_title() {
        let item = json!({"description": "Empanelment of auditors", "end_date": ""});
        let out = validate_notification(&item).unwrap();
        assert_eq!(out["title"], "Empanelment of auditors");
        assert!(!out.contains_key("description"));
    }
}
