//! Database module: query models and SQL repositories.
//!
//! - `model`: filters, write models and summaries used by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! Callers import from `tender_scout::db`; the repository API and its models
//! are re-exported here.

pub mod model;
pub mod repo;

pub use model::{NewRunOutcome, NotificationFilter, RunStatusCount};
pub use repo::*;
