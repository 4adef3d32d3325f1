//! Page-layout specific extraction.
//!
//! Each page-type tag maps to exactly one strategy. A strategy first checks
//! that the loaded page has the shape it expects, then turns it into
//! candidate records.

pub mod generic;
pub mod list;
pub mod table;

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::ElementRef;

use crate::dates::DateResolver;
use crate::engine::PageSession;
use crate::error::ScrapeError;
use crate::inference::{Inference, InferenceError};
use crate::model::{CandidateRecord, ExtractionHints, PageType, Source};

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Shared collaborators for one extraction.
pub struct ExtractContext<'a> {
    pub inference: &'a Inference,
    pub today: NaiveDate,
}

impl<'a> ExtractContext<'a> {
    pub fn dates(&self) -> DateResolver<'a> {
        DateResolver::new(self.inference, self.today)
    }
}

/// What a strategy pulled out of a page.
#[derive(Debug, Default)]
pub struct Extraction {
    pub candidates: Vec<CandidateRecord>,
    /// Items rejected with a warning.
    pub dropped: usize,
    pub payload_bytes: usize,
    /// Set when the inference fallback failed and the page yielded nothing.
    pub degraded: Option<InferenceError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Table,
    List,
    Generic,
}

impl Strategy {
    pub fn for_page_type(page_type: PageType) -> Self {
        match page_type {
            PageType::Table => Strategy::Table,
            PageType::List => Strategy::List,
            PageType::Generic => Strategy::Generic,
        }
    }

    /// Stored tags outside the known set use the generic strategy.
    pub fn for_tag(tag: &str) -> Self {
        Self::for_page_type(PageType::from_tag(tag))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Table => "table",
            Strategy::List => "list",
            Strategy::Generic => "generic",
        }
    }

    pub async fn validate_structure(
        &self,
        session: &dyn PageSession,
        hints: &ExtractionHints,
    ) -> Result<bool, ScrapeError> {
        match self {
            Strategy::Table => table::validate_structure(session, hints).await,
            Strategy::List => list::validate_structure(session, hints).await,
            Strategy::Generic => generic::validate_structure(session, hints).await,
        }
    }

    pub async fn extract(
        &self,
        session: &dyn PageSession,
        source: &Source,
        cx: &ExtractContext<'_>,
    ) -> Result<Extraction, ScrapeError> {
        match self {
            Strategy::Table => table::extract(session, &source.hints, cx).await,
            Strategy::List => list::extract(session, &source.hints, cx).await,
            Strategy::Generic => generic::extract(session, &source.hints, cx).await,
        }
    }
}

pub(crate) fn engine_error(err: anyhow::Error) -> ScrapeError {
    ScrapeError::Engine(format!("{err:#}"))
}

pub(crate) fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

pub(crate) fn element_text(el: ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().collect::<Vec<_>>().join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tags_fall_back_to_generic() {
        assert_eq!(Strategy::for_tag("table"), Strategy::Table);
        assert_eq!(Strategy::for_tag("LIST"), Strategy::List);
        assert_eq!(Strategy::for_tag("carousel"), Strategy::Generic);
        assert_eq!(Strategy::for_tag(""), Strategy::Generic);
    }

    #[test]
    fn whitespace_is_collapsed() {
        assert_eq!(collapse_whitespace("  a \n\t b  "), "a b");
    }
}
