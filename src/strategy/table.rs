//! Row-oriented pages: one candidate per data row, columns mapped through
//! header aliases onto canonical field names.

use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

use super::{collapse_whitespace, element_text, engine_error, ExtractContext, Extraction};
use crate::engine::PageSession;
use crate::error::ScrapeError;
use crate::model::{CandidateRecord, ExtractionHints};

pub const DEFAULT_TABLE_SELECTOR: &str = "table";

static ROW: Lazy<Selector> = Lazy::new(|| Selector::parse("tr").expect("row selector"));
static CELL: Lazy<Selector> = Lazy::new(|| Selector::parse("th, td").expect("cell selector"));

/// Display header (normalised) to canonical field.
const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("title", "title"),
    ("description", "title"),
    ("tender name", "title"),
    ("name of work", "title"),
    ("advertisement", "title"),
    ("tender id", "tender_id"),
    ("tender no", "tender_id"),
    ("reference no", "tender_id"),
    ("ref no", "tender_id"),
    ("location", "location"),
    ("place", "location"),
    ("category", "category"),
    ("type", "category"),
    ("start date", "start_date"),
    ("publish date", "start_date"),
    ("date of advertisement", "start_date"),
    ("end date", "end_date"),
    ("closing date", "end_date"),
    ("last date", "end_date"),
];

/// Fallback keys per canonical field, tried in order.
const FIELD_KEYS: &[(&str, &[&str])] = &[
    ("title", &["title", "description", "tender_name"]),
    ("tender_id", &["tender_id", "reference_no"]),
    ("location", &["location", "place"]),
    ("category", &["category", "type"]),
    ("start_date", &["start_date", "publish_date"]),
    ("end_date", &["end_date", "closing_date"]),
];

fn normalise_header(raw: &str) -> String {
    collapse_whitespace(raw)
        .to_lowercase()
        .trim_end_matches(['.', ':', '*'])
        .trim()
        .to_string()
}

fn snake(header: &str) -> String {
    header
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Map a display header to its canonical field. Per-source aliases win over
/// the built-in table; unknown headers become snake_case keys.
pub fn canonical_header(raw: &str, custom: &BTreeMap<String, String>) -> String {
    let header = normalise_header(raw);
    if let Some(mapped) = custom
        .iter()
        .find(|(k, _)| normalise_header(k) == header)
        .map(|(_, v)| v.clone())
    {
        return mapped;
    }
    BUILTIN_ALIASES
        .iter()
        .find(|(k, _)| *k == header)
        .map(|(_, v)| v.to_string())
        .unwrap_or_else(|| snake(&header))
}

/// Header row plus non-empty data rows of a table fragment.
pub fn parse_rows(table_html: &str) -> (Vec<String>, Vec<Vec<String>>) {
    let fragment = Html::parse_fragment(table_html);
    let mut rows = fragment
        .select(&ROW)
        .map(|tr| tr.select(&CELL).map(element_text).collect::<Vec<_>>());
    let headers = rows.next().unwrap_or_default();
    let data = rows
        .filter(|cells| cells.iter().any(|c| !c.is_empty()))
        .collect();
    (headers, data)
}

fn row_fields(headers: &[String], cells: &[String]) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    for (key, value) in headers.iter().zip(cells) {
        if key.is_empty() || value.is_empty() {
            continue;
        }
        fields.entry(key.clone()).or_insert_with(|| value.clone());
    }
    fields
}

fn pick<'a>(fields: &'a BTreeMap<String, String>, field: &str) -> Option<&'a str> {
    FIELD_KEYS
        .iter()
        .find(|(name, _)| *name == field)
        .into_iter()
        .flat_map(|(_, keys)| keys.iter())
        .find_map(|k| fields.get(*k).map(String::as_str))
}

fn selector(hints: &ExtractionHints) -> &str {
    hints
        .table_selector
        .as_deref()
        .unwrap_or(DEFAULT_TABLE_SELECTOR)
}

/// At least a header row and one data row.
pub async fn validate_structure(
    session: &dyn PageSession,
    hints: &ExtractionHints,
) -> Result<bool, ScrapeError> {
    let Some(html) = session
        .query_html(selector(hints))
        .await
        .map_err(engine_error)?
    else {
        return Ok(false);
    };
    Ok(count_rows(&html) >= 2)
}

fn count_rows(html: &str) -> usize {
    Html::parse_fragment(html).select(&ROW).count()
}

pub async fn extract(
    session: &dyn PageSession,
    hints: &ExtractionHints,
    cx: &ExtractContext<'_>,
) -> Result<Extraction, ScrapeError> {
    let html = session
        .query_html(selector(hints))
        .await
        .map_err(engine_error)?
        .ok_or_else(|| ScrapeError::StructureInvalid("table disappeared".into()))?;

    let (raw_headers, rows) = parse_rows(&html);
    let headers: Vec<String> = raw_headers
        .iter()
        .map(|h| canonical_header(h, &hints.header_mapping))
        .collect();
    debug!(?headers, rows = rows.len(), "table parsed");

    let dates = cx.dates();
    let mut out = Extraction {
        payload_bytes: html.len(),
        ..Default::default()
    };
    for cells in rows {
        let fields = row_fields(&headers, &cells);
        let Some(title) = pick(&fields, "title") else {
            continue;
        };
        let extracted: Map<String, Value> = fields
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        out.candidates.push(CandidateRecord {
            title: title.to_string(),
            tender_id: pick(&fields, "tender_id").map(str::to_string),
            location: pick(&fields, "location").map(str::to_string),
            category: pick(&fields, "category").map(str::to_string),
            start_date: dates.resolve(pick(&fields, "start_date")).await,
            end_date: dates.resolve(pick(&fields, "end_date")).await,
            extracted,
            raw_snippet: Some(cells.join(" | ")),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_aliases_cover_common_headers() {
        let none = BTreeMap::new();
        assert_eq!(canonical_header("Advertisement", &none), "title");
        assert_eq!(canonical_header("Date of Advertisement", &none), "start_date");
        assert_eq!(canonical_header(" Last  Date ", &none), "end_date");
        assert_eq!(canonical_header("Reference No.", &none), "tender_id");
        assert_eq!(canonical_header("Estimated Cost (Rs)", &none), "estimated_cost_rs");
    }

    #[test]
    fn source_aliases_override_builtins() {
        let mut custom = BTreeMap::new();
        custom.insert("Type".to_string(), "tender_kind".to_string());
        custom.insert("Name of the Work".to_string(), "title".to_string());
        assert_eq!(canonical_header("type", &custom), "tender_kind");
        assert_eq!(canonical_header("NAME OF THE WORK", &custom), "title");
    }

    #[test]
    fn parse_rows_skips_empty_rows() {
        let html = "<table><tr><th>Title</th><th>Location</th></tr>\
                    <tr><td> A </td><td>Pune</td></tr>\
                    <tr><td></td><td> </td></tr>\
                    <tr><td>B</td><td></td></tr></table>";
        let (headers, rows) = parse_rows(html);
        assert_eq!(headers, vec!["Title", "Location"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec!["A", "Pune"]);
    }

    #[test]
    fn first_non_empty_alias_wins() {
        let headers = vec!["title".to_string(), "title".to_string()];
        let fields = row_fields(&headers, &["".into(), "From description".into()]);
        assert_eq!(pick(&fields, "title"), Some("From description"));
        assert_eq!(pick(&fields, "location"), None);
    }
}
