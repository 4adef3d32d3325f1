use super::model::{NewRunOutcome, NotificationFilter, RunStatusCount};
use crate::model::{
    CandidateRecord, ExtractionHints, NewSource, NotificationRecord, NotificationStatus, PageType,
    RunOutcome, RunStatus, Source,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {normalized}"))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. Leaves in-memory URLs
/// untouched.
pub fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let query = match query_part {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{q}&mode=rwc"),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{expanded_path}?{query}")
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("failed to apply database migrations")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

fn source_from_row(row: &SqliteRow) -> Result<Source> {
    let id: i64 = row.try_get("id")?;
    let hints_json: String = row.try_get("hints")?;
    let hints: ExtractionHints = serde_json::from_str(&hints_json).unwrap_or_else(|err| {
        warn!(source_id = id, %err, "ignoring unreadable extraction hints");
        ExtractionHints::default()
    });
    let frequency: i64 = row.try_get("scrape_frequency_hours")?;
    let page_type: String = row.try_get("page_type")?;
    Ok(Source {
        id,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        page_type: PageType::from_tag(&page_type),
        scrape_frequency_hours: u32::try_from(frequency).unwrap_or(0),
        active: row.try_get("active")?,
        hints,
        success_count: row.try_get("success_count")?,
        error_count: row.try_get("error_count")?,
        last_scraped_at: row.try_get("last_scraped_at")?,
        last_success_at: row.try_get("last_success_at")?,
        notes: row.try_get("notes")?,
    })
}

const SOURCE_COLUMNS: &str = "id, name, url, page_type, scrape_frequency_hours, active, hints, \
     success_count, error_count, last_scraped_at, last_success_at, notes";

#[instrument(skip_all)]
pub async fn create_source(pool: &Pool, source: &NewSource) -> Result<i64> {
    let hints = serde_json::to_string(&source.hints)?;
    let rec = sqlx::query(
        "INSERT INTO sources (name, url, page_type, scrape_frequency_hours, hints, notes) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&source.name)
    .bind(&source.url)
    .bind(source.page_type.as_str())
    .bind(i64::from(source.scrape_frequency_hours))
    .bind(hints)
    .bind(&source.notes)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to create source {}", source.url))?;
    Ok(rec.get::<i64, _>("id"))
}

#[instrument(skip_all)]
pub async fn get_source(pool: &Pool, source_id: i64) -> Result<Option<Source>> {
    let row = sqlx::query(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?"))
        .bind(source_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(source_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_active_sources(pool: &Pool) -> Result<Vec<Source>> {
    let rows = sqlx::query(&format!(
        "SELECT {SOURCE_COLUMNS} FROM sources WHERE active = 1 ORDER BY id"
    ))
    .fetch_all(pool)
    .await?;
    rows.iter().map(source_from_row).collect()
}

#[instrument(skip_all)]
pub async fn list_sources(pool: &Pool) -> Result<Vec<Source>> {
    let rows = sqlx::query(&format!("SELECT {SOURCE_COLUMNS} FROM sources ORDER BY id"))
        .fetch_all(pool)
        .await?;
    rows.iter().map(source_from_row).collect()
}

/// Soft-delete; returns false when the source does not exist.
#[instrument(skip_all)]
pub async fn deactivate_source(pool: &Pool, source_id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE sources SET active = 0, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(source_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Insert unless (source, fingerprint) already exists. True when a row was written.
pub async fn insert_notification_if_absent(
    conn: &mut SqliteConnection,
    source_id: i64,
    fingerprint: &str,
    record: &CandidateRecord,
    seen_at: DateTime<Utc>,
) -> Result<bool> {
    let extracted = serde_json::to_string(&record.extracted)?;
    let res = sqlx::query(
        "INSERT INTO notifications (source_id, fingerprint, title, tender_id, location, category, \
         start_date, end_date, status, extracted, raw_snippet, first_seen_at, is_new) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1) \
         ON CONFLICT(source_id, fingerprint) DO NOTHING",
    )
    .bind(source_id)
    .bind(fingerprint)
    .bind(&record.title)
    .bind(&record.tender_id)
    .bind(&record.location)
    .bind(&record.category)
    .bind(record.start_date)
    .bind(record.end_date)
    .bind(NotificationStatus::Active.as_str())
    .bind(extracted)
    .bind(&record.raw_snippet)
    .bind(seen_at)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

fn notification_from_row(row: &SqliteRow) -> Result<NotificationRecord> {
    let id: i64 = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let extracted: String = row.try_get("extracted")?;
    Ok(NotificationRecord {
        id,
        source_id: row.try_get("source_id")?,
        fingerprint: row.try_get("fingerprint")?,
        title: row.try_get("title")?,
        tender_id: row.try_get("tender_id")?,
        location: row.try_get("location")?,
        category: row.try_get("category")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        status: NotificationStatus::parse_status(&status)
            .ok_or_else(|| anyhow!("notification {} has unknown status {}", id, status))?,
        extracted: serde_json::from_str::<Map<String, Value>>(&extracted).unwrap_or_default(),
        raw_snippet: row.try_get("raw_snippet")?,
        first_seen_at: row.try_get("first_seen_at")?,
        is_new: row.try_get("is_new")?,
    })
}

#[instrument(skip_all)]
pub async fn list_notifications(
    pool: &Pool,
    filter: &NotificationFilter,
    today: NaiveDate,
) -> Result<Vec<NotificationRecord>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT id, source_id, fingerprint, title, tender_id, location, category, start_date, \
         end_date, status, extracted, raw_snippet, first_seen_at, is_new FROM notifications WHERE 1 = 1",
    );
    if let Some(source_id) = filter.source_id {
        qb.push(" AND source_id = ").push_bind(source_id);
    }
    match filter.status {
        Some(NotificationStatus::Active) => {
            qb.push(" AND status = 'active' AND (end_date IS NULL OR end_date >= ")
                .push_bind(today)
                .push(")");
        }
        Some(NotificationStatus::Expired) => {
            qb.push(" AND status <> 'cancelled' AND (status = 'expired' OR end_date < ")
                .push_bind(today)
                .push(")");
        }
        Some(NotificationStatus::Cancelled) => {
            qb.push(" AND status = 'cancelled'");
        }
        None => {}
    }
    if filter.only_new {
        qb.push(" AND is_new = 1");
    }
    qb.push(" ORDER BY first_seen_at DESC, id DESC LIMIT ")
        .push_bind(filter.limit)
        .push(" OFFSET ")
        .push_bind(filter.offset);

    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(notification_from_row).collect()
}

#[instrument(skip_all)]
pub async fn count_notifications(pool: &Pool, source_id: Option<i64>) -> Result<i64> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM notifications WHERE (? IS NULL OR source_id = ?)",
    )
    .bind(source_id)
    .bind(source_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Clear the "new" flag once an operator has looked at a source's notifications.
#[instrument(skip_all)]
pub async fn mark_notifications_seen(pool: &Pool, source_id: Option<i64>) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE notifications SET is_new = 0 WHERE is_new = 1 AND (? IS NULL OR source_id = ?)",
    )
    .bind(source_id)
    .bind(source_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

// ---------------------------------------------------------------------------
// Run outcomes
// ---------------------------------------------------------------------------

/// Append a run outcome and roll the source's counters and timestamps in one
/// transaction.
#[instrument(skip_all, fields(source_id = outcome.source_id, status = outcome.status.as_str()))]
pub async fn record_run_outcome(pool: &Pool, outcome: &NewRunOutcome) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id: i64 = sqlx::query(
        "INSERT INTO run_outcomes (source_id, ran_at, status, records_found, records_new, \
         error_detail, duration_ms, payload_bytes) VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(outcome.source_id)
    .bind(outcome.ran_at)
    .bind(outcome.status.as_str())
    .bind(outcome.records_found)
    .bind(outcome.records_new)
    .bind(&outcome.error_detail)
    .bind(outcome.duration_ms)
    .bind(outcome.payload_bytes)
    .fetch_one(&mut *tx)
    .await?
    .get("id");

    let update = if outcome.status.is_success() {
        "UPDATE sources SET success_count = success_count + 1, last_scraped_at = ?, \
         last_success_at = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?"
    } else {
        "UPDATE sources SET error_count = error_count + 1, last_scraped_at = ?, \
         last_success_at = COALESCE(?, last_success_at), updated_at = CURRENT_TIMESTAMP WHERE id = ?"
    };
    let success_at = outcome.status.is_success().then_some(outcome.ran_at);
    let res = sqlx::query(update)
        .bind(outcome.ran_at)
        .bind(success_at)
        .bind(outcome.source_id)
        .execute(&mut *tx)
        .await?;
    if res.rows_affected() != 1 {
        return Err(anyhow!("source {} not found", outcome.source_id));
    }
    tx.commit().await?;
    Ok(id)
}

fn run_outcome_from_row(row: &SqliteRow) -> Result<RunOutcome> {
    let id: i64 = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    Ok(RunOutcome {
        id,
        source_id: row.try_get("source_id")?,
        ran_at: row.try_get("ran_at")?,
        status: RunStatus::parse_status(&status)
            .ok_or_else(|| anyhow!("run outcome {} has unknown status {}", id, status))?,
        records_found: row.try_get("records_found")?,
        records_new: row.try_get("records_new")?,
        error_detail: row.try_get("error_detail")?,
        duration_ms: row.try_get("duration_ms")?,
        payload_bytes: row.try_get("payload_bytes")?,
    })
}

/// Newest first.
#[instrument(skip_all)]
pub async fn recent_run_outcomes(
    pool: &Pool,
    source_id: Option<i64>,
    since: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<RunOutcome>> {
    let rows = sqlx::query(
        "SELECT id, source_id, ran_at, status, records_found, records_new, error_detail, \
         duration_ms, payload_bytes FROM run_outcomes \
         WHERE (? IS NULL OR source_id = ?) AND ran_at >= ? \
         ORDER BY ran_at DESC, id DESC LIMIT ?",
    )
    .bind(source_id)
    .bind(source_id)
    .bind(since)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(run_outcome_from_row).collect()
}

#[instrument(skip_all)]
pub async fn run_status_counts(pool: &Pool, since: DateTime<Utc>) -> Result<Vec<RunStatusCount>> {
    let rows = sqlx::query(
        "SELECT status, COUNT(*) AS runs, COALESCE(SUM(records_new), 0) AS records_new \
         FROM run_outcomes WHERE ran_at >= ? GROUP BY status ORDER BY status",
    )
    .bind(since)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            let status: String = row.try_get("status")?;
            Ok(RunStatusCount {
                status: RunStatus::parse_status(&status)
                    .ok_or_else(|| anyhow!("unknown run status {}", status))?,
                runs: row.try_get("runs")?,
                records_new: row.try_get("records_new")?,
            })
        })
        .collect()
}

/// Delete run-log rows older than `before`.
#[instrument(skip_all)]
pub async fn prune_run_outcomes(pool: &Pool, before: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query("DELETE FROM run_outcomes WHERE ran_at < ?")
        .bind(before)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_urls_pass_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://localhost/db"),
            "postgres://localhost/db"
        );
    }

    #[test]
    fn file_urls_get_parent_dir_and_create_mode() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested/dir/scout.db");
        let url = format!("sqlite://{}", path.display());
        let prepared = prepare_sqlite_url(&url);
        assert_eq!(prepared, format!("sqlite://{}?mode=rwc", path.display()));
        assert!(path.parent().unwrap().exists());

        let with_mode = format!("sqlite://{}?mode=ro", path.display());
        assert_eq!(prepare_sqlite_url(&with_mode), with_mode);
    }
}
