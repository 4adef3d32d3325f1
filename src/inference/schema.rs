//! Coercion of raw completion text into checked JSON.

use super::InferenceError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static FENCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)\s*```").expect("fenced block regex"));

/// Expected response shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    /// Required keys, each checked against its own schema.
    Object(Vec<(&'static str, Schema)>),
    /// Homogeneous list; every element is checked against the inner schema.
    List(Box<Schema>),
    /// Free-form leaf. Presence is checked by the enclosing object, the value is not.
    Text,
    NullableString,
    NullableObject,
}

impl Schema {
    pub fn object<const N: usize>(fields: [(&'static str, Schema); N]) -> Self {
        Schema::Object(fields.into_iter().collect())
    }

    pub fn list(inner: Schema) -> Self {
        Schema::List(Box::new(inner))
    }

    pub fn check(&self, value: &Value) -> Result<(), InferenceError> {
        check_at(self, value, "$")
    }
}

fn check_at(schema: &Schema, value: &Value, path: &str) -> Result<(), InferenceError> {
    match schema {
        Schema::Object(fields) => {
            let map = value
                .as_object()
                .ok_or_else(|| violation(path, format!("expected object, got {}", kind(value))))?;
            for (key, inner) in fields {
                let child = map
                    .get(*key)
                    .ok_or_else(|| violation(path, format!("missing key `{key}`")))?;
                check_at(inner, child, &format!("{path}.{key}"))?;
            }
            Ok(())
        }
        Schema::List(inner) => {
            let items = value
                .as_array()
                .ok_or_else(|| violation(path, format!("expected list, got {}", kind(value))))?;
            for (i, item) in items.iter().enumerate() {
                check_at(inner, item, &format!("{path}[{i}]"))?;
            }
            Ok(())
        }
        Schema::Text => Ok(()),
        Schema::NullableString => match value {
            Value::Null | Value::String(_) => Ok(()),
            other => Err(violation(
                path,
                format!("expected string or null, got {}", kind(other)),
            )),
        },
        Schema::NullableObject => match value {
            Value::Null | Value::Object(_) => Ok(()),
            other => Err(violation(
                path,
                format!("expected object or null, got {}", kind(other)),
            )),
        },
    }
}

fn violation(path: &str, reason: String) -> InferenceError {
    InferenceError::SchemaViolation {
        path: path.to_string(),
        reason,
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// The part of a completion that should hold the JSON payload: a fenced
/// code block, else the outermost brace span, else the whole text.
pub fn extract_span(raw: &str) -> &str {
    if let Some(inner) = FENCED.captures(raw).and_then(|c| c.get(1)) {
        return inner.as_str();
    }
    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if start < end {
            return &raw[start..=end];
        }
    }
    raw.trim()
}

/// Parse a completion into JSON. A parse failure is reported as malformed
/// and is never retried here.
pub fn parse_response(raw: &str) -> Result<Value, InferenceError> {
    let span = extract_span(raw);
    serde_json::from_str(span).map_err(|e| InferenceError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn span_prefers_fenced_block() {
        let raw = "Here you go:\n```json\n{\"type\": \"table\"}\n```\nand {ignored}";
        assert_eq!(extract_span(raw), "{\"type\": \"table\"}");
    }

    #[test]
    fn span_falls_back_to_braces_then_raw() {
        assert_eq!(
            extract_span("Sure! {\"date\": null} hope that helps"),
            "{\"date\": null}"
        );
        assert_eq!(extract_span("  plain text  "), "plain text");
    }

    #[test]
    fn malformed_text_is_reported() {
        let err = parse_response("not json at all").unwrap_err();
        assert!(matches!(err, InferenceError::Malformed(_)));
    }

    #[test]
    fn nested_schema_is_checked_elementwise() {
        let schema = Schema::object([(
            "notifications",
            Schema::list(Schema::object([
                ("title", Schema::Text),
                ("location", Schema::NullableString),
                ("extra", Schema::NullableObject),
            ])),
        )]);

        let ok = json!({"notifications": [
            {"title": "A", "location": null, "extra": {"k": 1}},
            {"title": "B", "location": "Pune", "extra": null}
        ]});
        assert!(schema.check(&ok).is_ok());

        let bad = json!({"notifications": [
            {"title": "A", "location": null, "extra": null},
            {"title": "B", "location": 7, "extra": null}
        ]});
        match schema.check(&bad).unwrap_err() {
            InferenceError::SchemaViolation { path, .. } => {
                assert_eq!(path, "$.notifications[1].location")
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let missing = json!({"notifications": [{"title": "A", "location": null}]});
        assert!(matches!(
            schema.check(&missing),
            Err(InferenceError::SchemaViolation { .. })
        ));
        assert!(schema.check(&json!({"notifications": {}})).is_err());
    }
}
