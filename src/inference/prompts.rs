//! Prompt catalogue for the completion service.

use super::schema::Schema;
use chrono::NaiveDate;

const NOTIFICATION_SYSTEM: &str = "You are a precise and accurate information extractor. \
Your task is to extract structured information about tenders, notifications, or empanelment \
opportunities from the given text. Focus on the title or description, the tender ID or \
reference number, location, category or type, and important dates (start date, end date, \
submission deadline). Extract only factual information present in the text. Do not make \
assumptions or add information not present in the text. Respond with JSON only.";

const CLASSIFY_SYSTEM: &str = "You are a web page structure analyzer. Your task is to \
classify pages based on their content structure. Respond with JSON only.";

const DATE_SYSTEM: &str = "You are a date parsing expert. Your task is to identify and \
convert date strings into a standardized YYYY-MM-DD format. Consider various date formats \
and contexts to accurately determine the date. If a date is ambiguous or invalid, return null. \
Respond with JSON only.";

const LOCATION_SYSTEM: &str = "You are a location information extractor. Your task is to \
identify geographical locations in text. Respond with JSON only.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    ExtractNotifications,
    ClassifyPage,
    ParseDate,
    ExtractLocation,
}

impl PromptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptKind::ExtractNotifications => "extract_notifications",
            PromptKind::ClassifyPage => "classify_page",
            PromptKind::ParseDate => "parse_date",
            PromptKind::ExtractLocation => "extract_location",
        }
    }

    pub fn system_context(&self) -> &'static str {
        match self {
            PromptKind::ExtractNotifications => NOTIFICATION_SYSTEM,
            PromptKind::ClassifyPage => CLASSIFY_SYSTEM,
            PromptKind::ParseDate => DATE_SYSTEM,
            PromptKind::ExtractLocation => LOCATION_SYSTEM,
        }
    }

    /// Shape the parsed response must have.
    pub fn schema(&self) -> Schema {
        match self {
            PromptKind::ExtractNotifications => Schema::object([(
                "notifications",
                Schema::list(Schema::object([
                    ("title", Schema::Text),
                    ("tender_id", Schema::NullableString),
                    ("location", Schema::NullableString),
                    ("category", Schema::NullableString),
                    ("start_date", Schema::NullableString),
                    ("end_date", Schema::NullableString),
                ])),
            )]),
            PromptKind::ClassifyPage => Schema::object([("type", Schema::Text)]),
            PromptKind::ParseDate => Schema::object([("date", Schema::NullableString)]),
            PromptKind::ExtractLocation => Schema::object([("location", Schema::NullableString)]),
        }
    }

    fn output_format(&self) -> &'static str {
        match self {
            PromptKind::ExtractNotifications => {
                r#"{"notifications": [{"title": "string", "tender_id": "string | null", "location": "string | null", "category": "string | null", "start_date": "YYYY-MM-DD | null", "end_date": "YYYY-MM-DD | null", "additional_info": "object | null"}]}"#
            }
            PromptKind::ClassifyPage => r#"{"type": "table | list | generic"}"#,
            PromptKind::ParseDate => r#"{"date": "YYYY-MM-DD | null"}"#,
            PromptKind::ExtractLocation => r#"{"location": "string | null"}"#,
        }
    }
}

/// A prompt kind together with its parameters.
#[derive(Debug, Clone)]
pub enum PromptRequest<'a> {
    ExtractNotifications { text: &'a str },
    ClassifyPage { text: &'a str },
    ParseDate { raw: &'a str, today: NaiveDate },
    ExtractLocation { text: &'a str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPrompt {
    pub kind: PromptKind,
    pub system: &'static str,
    pub prompt: String,
    pub schema: Schema,
}

impl PromptRequest<'_> {
    pub fn kind(&self) -> PromptKind {
        match self {
            PromptRequest::ExtractNotifications { .. } => PromptKind::ExtractNotifications,
            PromptRequest::ClassifyPage { .. } => PromptKind::ClassifyPage,
            PromptRequest::ParseDate { .. } => PromptKind::ParseDate,
            PromptRequest::ExtractLocation { .. } => PromptKind::ExtractLocation,
        }
    }

    pub fn render(&self) -> RenderedPrompt {
        let kind = self.kind();
        let body = match self {
            PromptRequest::ExtractNotifications { text } => format!(
                "Analyze the following text and extract information about tenders or notifications:\n\n\
                 {text}\n\n\
                 If any field is not found, use null."
            ),
            PromptRequest::ClassifyPage { text } => format!(
                "Analyze the following page content and determine its structure type:\n\n\
                 {text}\n\n\
                 Classify the page as one of:\n\
                 - table: Content is primarily in a tabular format\n\
                 - list: Content is organized as a list of items\n\
                 - generic: Content has no clear structural pattern"
            ),
            PromptRequest::ParseDate { raw, today } => format!(
                "Parse the following date string into YYYY-MM-DD format:\n\n\
                 {raw}\n\n\
                 Consider the current date is {} for resolving relative dates.\n\
                 If the date is invalid or cannot be determined, return null.",
                today.format("%Y-%m-%d")
            ),
            PromptRequest::ExtractLocation { text } => format!(
                "Extract the location information from the following text:\n\n\
                 {text}\n\n\
                 Return the most specific location mentioned. Consider cities, districts, \
                 states, and regions. If no location is found, return null."
            ),
        };
        RenderedPrompt {
            kind,
            system: kind.system_context(),
            prompt: format!(
                "{body}\n\nAnswer in this JSON format:\n{}",
                kind.output_format()
            ),
            schema: kind.schema(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_date_prompt_carries_reference_date() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 15).unwrap();
        let rendered = PromptRequest::ParseDate {
            raw: "next Friday",
            today,
        }
        .render();
        assert_eq!(rendered.kind, PromptKind::ParseDate);
        assert!(rendered.prompt.contains("next Friday"));
        assert!(rendered.prompt.contains("2025-06-15"));
        assert!(rendered.prompt.contains(r#"{"date": "YYYY-MM-DD | null"}"#));
        assert_eq!(rendered.system, DATE_SYSTEM);
    }

    #[test]
    fn every_kind_has_a_distinct_name() {
        let names: std::collections::BTreeSet<_> = [
            PromptKind::ExtractNotifications,
            PromptKind::ClassifyPage,
            PromptKind::ParseDate,
            PromptKind::ExtractLocation,
        ]
        .iter()
        .map(|k| k.as_str())
        .collect();
        assert_eq!(names.len(), 4);
    }
}
