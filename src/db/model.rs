//! Query and write models used by repositories.
//!
//! Keep these structs focused on what goes in and out of SQL. Business logic
//! lives in the gateway and the job runner.

use crate::model::{NotificationStatus, RunStatus};
use chrono::{DateTime, Utc};

/// Filter for notification listings. Status filtering uses the derived
/// status, so `Expired` matches rows whose end date has passed.
#[derive(Debug, Clone)]
pub struct NotificationFilter {
    pub source_id: Option<i64>,
    pub status: Option<NotificationStatus>,
    pub only_new: bool,
    pub limit: i64,
    pub offset: i64,
}

impl Default for NotificationFilter {
    fn default() -> Self {
        Self {
            source_id: None,
            status: None,
            only_new: false,
            limit: 100,
            offset: 0,
        }
    }
}

/// One job attempt, ready to be appended to the run log.
#[derive(Debug, Clone)]
pub struct NewRunOutcome {
    pub source_id: i64,
    pub ran_at: DateTime<Utc>,
    pub status: RunStatus,
    pub records_found: i64,
    pub records_new: i64,
    pub error_detail: Option<String>,
    pub duration_ms: i64,
    pub payload_bytes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStatusCount {
    pub status: RunStatus,
    pub runs: i64,
    pub records_new: i64,
}
