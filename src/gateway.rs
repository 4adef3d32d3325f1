//! Deduplication and persistence of extracted candidates.
//!
//! The (source, fingerprint) pair is the only duplicate key. Fingerprints are
//! computed over a canonical, key-sorted rendering of every field so that two
//! extractions of the same content hash identically regardless of the order
//! fields were produced in.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};

use crate::db::{self, NewRunOutcome, Pool};
use crate::model::CandidateRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub stored: usize,
    pub skipped: usize,
}

fn canonical(record: &CandidateRecord) -> BTreeMap<&'static str, Value> {
    let date = |d: Option<chrono::NaiveDate>| {
        d.map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null)
    };
    BTreeMap::from([
        ("title", json!(record.title.trim())),
        ("tender_id", json!(record.tender_id)),
        ("location", json!(record.location)),
        ("category", json!(record.category)),
        ("start_date", date(record.start_date)),
        ("end_date", date(record.end_date)),
        ("extracted", canonical_value(&Value::Object(record.extracted.clone()))),
        ("raw_snippet", json!(record.raw_snippet)),
    ])
}

/// Re-key nested objects through a BTreeMap so key order never leaks into the hash.
fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonical_value(v))).collect();
            json!(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}

/// Hex SHA-256 over the canonical field set.
pub fn fingerprint(record: &CandidateRecord) -> String {
    let encoded = serde_json::to_string(&canonical(record)).unwrap_or_default();
    format!("{:x}", Sha256::digest(encoded.as_bytes()))
}

/// Store candidates not seen before for this source.
#[instrument(skip_all, fields(source_id = source_id, candidates = candidates.len()))]
pub async fn ingest(pool: &Pool, source_id: i64, candidates: &[CandidateRecord]) -> Result<IngestSummary> {
    let now = Utc::now();
    let mut summary = IngestSummary::default();
    let mut tx = pool.begin().await?;
    for record in candidates {
        let fp = fingerprint(record);
        if db::insert_notification_if_absent(&mut *tx, source_id, &fp, record, now).await? {
            summary.stored += 1;
        } else {
            debug!(fingerprint = %fp, "duplicate candidate skipped");
            summary.skipped += 1;
        }
    }
    tx.commit().await?;
    Ok(summary)
}

/// Write the run outcome together with the source counters, retrying once.
#[instrument(skip_all, fields(source_id = outcome.source_id))]
pub async fn record_outcome(pool: &Pool, outcome: &NewRunOutcome) -> Result<i64> {
    match db::record_run_outcome(pool, outcome).await {
        Ok(id) => Ok(id),
        Err(err) => {
            warn!(?err, "recording run outcome failed; retrying once");
            db::record_run_outcome(pool, outcome).await
        }
    }
}
