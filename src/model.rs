use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Declared page layout of a source; selects the extraction strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PageType {
    Table,
    List,
    Generic,
}

impl PageType {
    pub const ALL: [PageType; 3] = [PageType::Table, PageType::List, PageType::Generic];

    pub fn as_str(&self) -> &'static str {
        match self {
            PageType::Table => "table",
            PageType::List => "list",
            PageType::Generic => "generic",
        }
    }

    /// Strict parse; `None` for anything outside the allow-list.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "table" => Some(PageType::Table),
            "list" => Some(PageType::List),
            "generic" => Some(PageType::Generic),
            _ => None,
        }
    }

    /// Lenient parse used for stored tags: unknown tags fall back to `Generic`.
    pub fn from_tag(tag: &str) -> Self {
        Self::parse(tag).unwrap_or(PageType::Generic)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Active,
    Expired,
    Cancelled,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Active => "active",
            NotificationStatus::Expired => "expired",
            NotificationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "active" => Some(NotificationStatus::Active),
            "expired" => Some(NotificationStatus::Expired),
            "cancelled" => Some(NotificationStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    Error,
    Timeout,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Error => "error",
            RunStatus::Timeout => "timeout",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "success" => Some(RunStatus::Success),
            "partial" => Some(RunStatus::Partial),
            "error" => Some(RunStatus::Error),
            "timeout" => Some(RunStatus::Timeout),
            _ => None,
        }
    }

    /// Success and partial runs count toward the success counter.
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Partial)
    }
}

/// Per-source selectors and header aliases, stored as JSON on the source row.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExtractionHints {
    pub table_selector: Option<String>,
    /// Lowercased header text -> canonical field name.
    pub header_mapping: BTreeMap<String, String>,
    pub list_selector: Option<String>,
    pub item_selector: Option<String>,
    pub content_selector: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub page_type: PageType,
    pub scrape_frequency_hours: u32,
    pub active: bool,
    pub hints: ExtractionHints,
    pub success_count: i64,
    pub error_count: i64,
    pub last_scraped_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

/// Administrator-supplied fields for a new source.
#[derive(Debug, Clone)]
pub struct NewSource {
    pub name: String,
    pub url: String,
    pub page_type: PageType,
    pub scrape_frequency_hours: u32,
    pub hints: ExtractionHints,
    pub notes: Option<String>,
}

/// Unvalidated extraction produced by a strategy; never persisted directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub title: String,
    pub tender_id: Option<String>,
    pub location: Option<String>,
    pub category: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub extracted: Map<String, Value>,
    pub raw_snippet: Option<String>,
}

impl CandidateRecord {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: i64,
    pub source_id: i64,
    pub fingerprint: String,
    pub title: String,
    pub tender_id: Option<String>,
    pub location: Option<String>,
    pub category: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub status: NotificationStatus,
    pub extracted: Map<String, Value>,
    pub raw_snippet: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub is_new: bool,
}

impl NotificationRecord {
    /// Expiry is derived from the end date; a cancelled record stays cancelled.
    pub fn effective_status(&self, today: NaiveDate) -> NotificationStatus {
        match (self.status, self.end_date) {
            (NotificationStatus::Cancelled, _) => NotificationStatus::Cancelled,
            (_, Some(end)) if end < today => NotificationStatus::Expired,
            (status, _) => status,
        }
    }

    pub fn days_remaining(&self, today: NaiveDate) -> Option<i64> {
        self.end_date
            .map(|end| (end - today).num_days().max(0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub id: i64,
    pub source_id: i64,
    pub ran_at: DateTime<Utc>,
    pub status: RunStatus,
    pub records_found: i64,
    pub records_new: i64,
    pub error_detail: Option<String>,
    pub duration_ms: i64,
    pub payload_bytes: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(end: Option<NaiveDate>, status: NotificationStatus) -> NotificationRecord {
        NotificationRecord {
            id: 1,
            source_id: 1,
            fingerprint: "f".into(),
            title: "t".into(),
            tender_id: None,
            location: None,
            category: None,
            start_date: None,
            end_date: end,
            status,
            extracted: Map::new(),
            raw_snippet: None,
            first_seen_at: Utc::now(),
            is_new: true,
        }
    }

    #[test]
    fn unknown_page_tag_defaults_to_generic() {
        assert_eq!(PageType::from_tag("TABLE"), PageType::Table);
        assert_eq!(PageType::from_tag("grid"), PageType::Generic);
        assert_eq!(PageType::parse("grid"), None);
    }

    #[test]
    fn expiry_is_derived_from_end_date() {
        let today = NaiveDate::from_ymd_opt(2025, 7, 1).unwrap();
        let past = NaiveDate::from_ymd_opt(2025, 6, 30);
        let future = NaiveDate::from_ymd_opt(2025, 7, 10);

        let r = record(past, NotificationStatus::Active);
        assert_eq!(r.effective_status(today), NotificationStatus::Expired);
        assert_eq!(r.days_remaining(today), Some(0));

        let r = record(future, NotificationStatus::Active);
        assert_eq!(r.effective_status(today), NotificationStatus::Active);
        assert_eq!(r.days_remaining(today), Some(9));

        let r = record(past, NotificationStatus::Cancelled);
        assert_eq!(r.effective_status(today), NotificationStatus::Cancelled);
    }

    #[test]
    fn run_status_roundtrips_its_tag() {
        for s in [
            RunStatus::Success,
            RunStatus::Partial,
            RunStatus::Error,
            RunStatus::Timeout,
        ] {
            assert_eq!(RunStatus::parse_status(s.as_str()), Some(s));
        }
        assert!(RunStatus::Partial.is_success());
        assert!(!RunStatus::Timeout.is_success());
    }
}
