//! Itemised pages: a container of repeated items, each carrying a title and
//! loosely formatted metadata in its text.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};
use std::collections::HashSet;

use super::{element_text, engine_error, ExtractContext, Extraction};
use crate::dates::DateResolver;
use crate::engine::PageSession;
use crate::error::ScrapeError;
use crate::model::{CandidateRecord, ExtractionHints};

pub const DEFAULT_LIST_SELECTOR: &str = ".notifications-list, .tenders-list";
pub const DEFAULT_ITEM_SELECTOR: &str = "li, .item, .notification";

const SNIPPET_LIMIT: usize = 2000;

static TITLE: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("a, h1, h2, h3, h4, h5, h6, .title, strong, em, b").expect("title selector")
});
static CATEGORY_ELEMENT: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".category, .type, .tag").expect("category selector"));

static DATE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\b\d{1,2}[-./]\d{1,2}[-./]\d{4}\b",
        r"\b\d{4}-\d{2}-\d{2}\b",
        r"(?i)\b\d{1,2}\s+(?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+\d{4}\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("date pattern"))
    .collect()
});

static TENDER_ID_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)tender\s+(?:no|number|id)\.?\s*[:.]?\s*([A-Za-z0-9_/-]+)",
        r"(?i)\bref(?:erence)?\.?\s*(?:no|number|id)?\.?\s*[:.]\s*([A-Za-z0-9_/-]+)",
        r"(?i)(?:notification|tender)\s+([A-Za-z0-9_/-]*\d[A-Za-z0-9_/-]*)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("tender id pattern"))
    .collect()
});

static LOCATION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\b(?:at|in|location:?)\s+([A-Za-z][A-Za-z ,]*?\s(?:district|city|state|region))\b",
        r"\b([A-Z][a-z]+(?:\s[A-Z][a-z]+)*\s(?:District|City|State|Region))\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("location pattern"))
    .collect()
});

const CATEGORY_KEYWORDS: &[&str] = &[
    "Construction",
    "Civil Work",
    "Electrical",
    "Mechanical",
    "IT Services",
    "Consultancy",
    "Supply",
    "Maintenance",
    "Security",
    "Catering",
    "Transportation",
    "Housekeeping",
    "Medical",
    "Legal",
    "Financial",
    "Engineering",
    "Procurement",
    "Installation",
    "AMC",
    "Software",
];

/// Per-item fields derived synchronously from markup.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedItem {
    pub title: String,
    pub text: String,
    pub html: String,
    pub date_strings: Vec<String>,
    pub tender_id: Option<String>,
    pub location: Option<String>,
    pub category: Option<String>,
}

fn item_selector(hints: &ExtractionHints) -> Result<Selector, ScrapeError> {
    let item = hints.item_selector.as_deref().unwrap_or(DEFAULT_ITEM_SELECTOR);
    Selector::parse(item)
        .map_err(|e| ScrapeError::StructureInvalid(format!("bad item selector {item:?}: {e}")))
}

fn list_selector(hints: &ExtractionHints) -> &str {
    hints.list_selector.as_deref().unwrap_or(DEFAULT_LIST_SELECTOR)
}

/// Outermost matches only; an item nested in another item is part of it.
fn top_level_items<'a>(fragment: &'a Html, item: &Selector) -> Vec<ElementRef<'a>> {
    let matched: Vec<ElementRef<'a>> = fragment.select(item).collect();
    let ids: HashSet<_> = matched.iter().map(|el| el.id()).collect();
    matched
        .into_iter()
        .filter(|el| !el.ancestors().any(|a| ids.contains(&a.id())))
        .collect()
}

pub fn first_tender_id(text: &str) -> Option<String> {
    TENDER_ID_PATTERNS
        .iter()
        .find_map(|re| re.captures(text).and_then(|c| c.get(1)))
        .map(|m| m.as_str().trim_end_matches(['.', '/', '-']).to_string())
        .filter(|s| !s.is_empty())
}

pub fn first_location(text: &str) -> Option<String> {
    LOCATION_PATTERNS
        .iter()
        .find_map(|re| re.captures(text).and_then(|c| c.get(1)))
        .map(|m| m.as_str().trim().trim_start_matches(',').trim().to_string())
        .filter(|s| s.len() > 3)
}

pub fn date_strings(text: &str) -> Vec<String> {
    DATE_PATTERNS
        .iter()
        .flat_map(|re| re.find_iter(text).map(|m| normalise_date(m.as_str())))
        .collect()
}

fn normalise_date(raw: &str) -> String {
    if raw.chars().any(|c| c.is_ascii_alphabetic()) {
        // "15 Jan. 2025": only the abbreviation dot goes.
        raw.replace('.', "")
    } else {
        raw.replace(['.', '/'], "-")
    }
}

fn title_case(word: &str) -> String {
    word.split(|c| c == '-' || c == '_')
        .filter(|s| !s.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

fn item_category(item: ElementRef<'_>, text: &str) -> Option<String> {
    if let Some(el) = item.select(&CATEGORY_ELEMENT).next() {
        let value = element_text(el);
        if !value.is_empty() {
            return Some(value);
        }
    }
    if let Some(class) = item.value().classes().find(|c| {
        let lower = c.to_ascii_lowercase();
        lower.ends_with("type") || lower.ends_with("category")
    }) {
        return Some(title_case(class));
    }
    let lower = text.to_lowercase();
    CATEGORY_KEYWORDS
        .iter()
        .find(|k| lower.contains(&k.to_lowercase()))
        .map(|k| k.to_string())
}

fn parse_item(item: ElementRef<'_>) -> Option<ParsedItem> {
    let text = element_text(item);
    let title = item
        .select(&TITLE)
        .map(element_text)
        .find(|t| !t.is_empty())
        .unwrap_or_else(|| text.clone());
    if title.is_empty() {
        return None;
    }
    let html: String = item.html().chars().take(SNIPPET_LIMIT).collect();
    Some(ParsedItem {
        date_strings: date_strings(&text),
        tender_id: first_tender_id(&text),
        location: first_location(&text),
        category: item_category(item, &text),
        title,
        text,
        html,
    })
}

/// Items of the first container matching the list selector.
pub fn parse_items(container_html: &str, hints: &ExtractionHints) -> Result<Vec<ParsedItem>, ScrapeError> {
    let item = item_selector(hints)?;
    let fragment = Html::parse_fragment(container_html);
    Ok(top_level_items(&fragment, &item)
        .into_iter()
        .filter_map(parse_item)
        .collect())
}

fn count_items(container_html: &str, hints: &ExtractionHints) -> Result<usize, ScrapeError> {
    let item = item_selector(hints)?;
    let fragment = Html::parse_fragment(container_html);
    Ok(top_level_items(&fragment, &item).len())
}

/// Earliest date starts the range, the latest ends it; a single date only starts it.
async fn date_range(
    dates: &DateResolver<'_>,
    raw: &[String],
) -> (Option<NaiveDate>, Option<NaiveDate>) {
    let mut found = Vec::new();
    for s in raw {
        if let Some(d) = dates.resolve(Some(s)).await {
            found.push(d);
        }
    }
    found.sort();
    match found.as_slice() {
        [] => (None, None),
        [only] => (Some(*only), None),
        [first, .., last] => (Some(*first), Some(*last)),
    }
}

/// Container present with at least one item.
pub async fn validate_structure(
    session: &dyn PageSession,
    hints: &ExtractionHints,
) -> Result<bool, ScrapeError> {
    let Some(html) = session
        .query_html(list_selector(hints))
        .await
        .map_err(engine_error)?
    else {
        return Ok(false);
    };
    Ok(count_items(&html, hints)? >= 1)
}

pub async fn extract(
    session: &dyn PageSession,
    hints: &ExtractionHints,
    cx: &ExtractContext<'_>,
) -> Result<Extraction, ScrapeError> {
    let html = session
        .query_html(list_selector(hints))
        .await
        .map_err(engine_error)?
        .ok_or_else(|| ScrapeError::StructureInvalid("list container disappeared".into()))?;
    let items = parse_items(&html, hints)?;

    let dates = cx.dates();
    let mut out = Extraction {
        payload_bytes: html.len(),
        ..Default::default()
    };
    for item in items {
        let (start_date, end_date) = date_range(&dates, &item.date_strings).await;
        let mut extracted = Map::new();
        extracted.insert("full_text".into(), Value::String(item.text));
        out.candidates.push(CandidateRecord {
            title: item.title,
            tender_id: item.tender_id,
            location: item.location,
            category: item.category,
            start_date,
            end_date,
            extracted,
            raw_snippet: Some(item.html),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <ul class="tenders-list">
          <li class="works-category">
            <a href="/t/1">Construction of boundary wall</a>
            <span>Tender No: KA/2025/117. Published 01-06-2025, closes 15 June 2025.
            Work at Mysuru District.</span>
          </li>
          <li><h4>Annual maintenance of lifts</h4><span class="tag">AMC</span>
            <p>Ref. No.: HQ-44 issued 2025-05-20</p></li>
          <li>Supply of stationery items for Pune City office</li>
        </ul>"#;

    #[test]
    fn items_are_parsed_with_the_pattern_battery() {
        let items = parse_items(PAGE, &ExtractionHints::default()).unwrap();
        assert_eq!(items.len(), 3);

        assert_eq!(items[0].title, "Construction of boundary wall");
        assert_eq!(items[0].tender_id.as_deref(), Some("KA/2025/117"));
        assert_eq!(items[0].location.as_deref(), Some("Mysuru District"));
        assert_eq!(items[0].category.as_deref(), Some("Works Category"));
        assert_eq!(items[0].date_strings, vec!["01-06-2025", "15 June 2025"]);

        assert_eq!(items[1].title, "Annual maintenance of lifts");
        assert_eq!(items[1].category.as_deref(), Some("AMC"));
        assert_eq!(items[1].tender_id.as_deref(), Some("HQ-44"));

        assert_eq!(items[2].title, "Supply of stationery items for Pune City office");
        assert_eq!(items[2].category.as_deref(), Some("Supply"));
        assert_eq!(items[2].location.as_deref(), Some("Pune City"));
        assert!(items[2].date_strings.is_empty());

        let abbreviated = date_strings("Closes 15 Jan. 2025, opened 02.01.2025");
        assert_eq!(abbreviated, vec!["02-01-2025", "15 Jan 2025"]);
        assert_eq!(
            crate::dates::parse_explicit(&abbreviated[1]),
            chrono::NaiveDate::from_ymd_opt(2025, 1, 15)
        );
    }

    #[test]
    fn nested_matches_are_not_counted_twice() {
        let html = r#"<div class="tenders-list"><div class="item"><ul><li>inner</li></ul></div></div>"#;
        assert_eq!(count_items(html, &ExtractionHints::default()).unwrap(), 1);
    }

    #[test]
    fn unmatched_fields_stay_empty() {
        assert_eq!(first_tender_id("no identifiers here"), None);
        assert_eq!(first_location("somewhere nice"), None);
    }
}
