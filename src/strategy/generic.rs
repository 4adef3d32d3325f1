//! Unstructured pages: the dominant text region is cleaned and handed to the
//! inference fallback.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::warn;

use super::{collapse_whitespace, engine_error, ExtractContext, Extraction};
use crate::dates::DateResolver;
use crate::engine::PageSession;
use crate::error::ScrapeError;
use crate::model::{CandidateRecord, ExtractionHints};

pub const DEFAULT_CONTENT_SELECTOR: &str = "main, #content, .content";
/// Text needed in the content region before the page counts as usable.
pub const MIN_CONTENT_CHARS: usize = 100;

static BOILERPLATE: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(?:copyright\s*)?©.*$",
        r"(?i)copyright\s+\d{4}.*$",
        r"(?i)all rights reserved\.?",
        r"(?i)privacy policy",
        r"(?i)terms of use",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("boilerplate pattern"))
    .collect()
});

fn selector(hints: &ExtractionHints) -> &str {
    hints
        .content_selector
        .as_deref()
        .unwrap_or(DEFAULT_CONTENT_SELECTOR)
}

/// Collapse whitespace and remove footer phrases.
pub fn clean_text(raw: &str) -> String {
    let mut text = collapse_whitespace(raw);
    for re in BOILERPLATE.iter() {
        text = re.replace_all(&text, "").into_owned();
    }
    collapse_whitespace(&text)
}

fn str_field(item: &Map<String, Value>, key: &str) -> Option<String> {
    item.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

async fn to_candidate(item: Map<String, Value>, dates: &DateResolver<'_>) -> Option<CandidateRecord> {
    let title = str_field(&item, "title")?;
    let start_date = dates.resolve(str_field(&item, "start_date").as_deref()).await;
    let end_date = dates.resolve(str_field(&item, "end_date").as_deref()).await;
    Some(CandidateRecord {
        title,
        tender_id: str_field(&item, "tender_id"),
        location: str_field(&item, "location"),
        category: str_field(&item, "category"),
        start_date,
        end_date,
        raw_snippet: serde_json::to_string(&item).ok(),
        extracted: item,
    })
}

pub async fn validate_structure(
    session: &dyn PageSession,
    hints: &ExtractionHints,
) -> Result<bool, ScrapeError> {
    let text = session
        .query_text(selector(hints))
        .await
        .map_err(engine_error)?;
    Ok(text
        .map(|t| t.trim().chars().count() > MIN_CONTENT_CHARS)
        .unwrap_or(false))
}

pub async fn extract(
    session: &dyn PageSession,
    hints: &ExtractionHints,
    cx: &ExtractContext<'_>,
) -> Result<Extraction, ScrapeError> {
    let raw = session
        .query_text(selector(hints))
        .await
        .map_err(engine_error)?
        .ok_or_else(|| ScrapeError::StructureInvalid("content region disappeared".into()))?;
    let text = clean_text(&raw);
    let mut out = Extraction {
        payload_bytes: raw.len(),
        ..Default::default()
    };

    let batch = match cx.inference.extract_notifications(&text).await {
        Ok(batch) => batch,
        Err(err) => {
            warn!(%err, "inference extraction failed; page yields no candidates");
            out.degraded = Some(err);
            return Ok(out);
        }
    };
    out.dropped = batch.dropped;

    let dates = cx.dates();
    for item in batch.items {
        match to_candidate(item, &dates).await {
            Some(candidate) => out.candidates.push(candidate),
            None => out.dropped += 1,
        }
    }
    Ok(out)
}
