use chrono::NaiveDate;

use crate::inference::Inference;

/// Explicit formats, tried in order before asking the inference service.
pub const EXPLICIT_FORMATS: &[&str] = &[
    "%d-%m-%Y", "%d/%m/%Y", "%Y-%m-%d", "%d.%m.%Y", "%d %B %Y", "%d %b %Y",
];

pub fn parse_explicit(raw: &str) -> Option<NaiveDate> {
    let cleaned = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let cleaned = cleaned.trim_end_matches(['.', ',']);
    EXPLICIT_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(cleaned, fmt).ok())
}

/// Explicit formats first, inference only when all of them fail.
pub struct DateResolver<'a> {
    inference: &'a Inference,
    today: NaiveDate,
}

impl<'a> DateResolver<'a> {
    pub fn new(inference: &'a Inference, today: NaiveDate) -> Self {
        Self { inference, today }
    }

    pub async fn resolve(&self, raw: Option<&str>) -> Option<NaiveDate> {
        let raw = raw.map(str::trim).filter(|s| s.chars().any(char::is_alphanumeric))?;
        if let Some(date) = parse_explicit(raw) {
            return Some(date);
        }
        self.inference.parse_date(raw, self.today).await
    }
}
