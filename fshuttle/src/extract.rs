//! Value extractors, transforms and conditions.
//!
//! These are plain data (deserialized from the plan) interpreted against a
//! row; evaluation never touches shared state.

use crate::coerce::float_to_i64;
use crate::models::{RawValue, Row};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Extractor {
    /// Value of a single column.
    Column { column: String },
    /// A literal, independent of the row.
    Constant { value: JsonValue },
    /// Text of every present part joined with `separator`.
    Concat {
        parts: Vec<Extractor>,
        #[serde(default)]
        separator: String,
    },
    /// The first candidate that yields any value.
    FirstOf { candidates: Vec<Extractor> },
    /// A source extractor followed by transforms applied to each value.
    Pipeline {
        source: Box<Extractor>,
        steps: Vec<Transform>,
    },
}

impl Extractor {
    pub fn column(name: impl Into<String>) -> Self {
        Extractor::Column {
            column: name.into(),
        }
    }

    /// Evaluates against a row, returning only present (non-null, non-blank) values.
    pub fn extract(&self, row: &Row) -> Result<Vec<RawValue>, String> {
        let mut values = self.evaluate(row)?;
        values.retain(|value| !value.is_blank());
        Ok(values)
    }

    fn evaluate(&self, row: &Row) -> Result<Vec<RawValue>, String> {
        match self {
            Extractor::Column { column } => Ok(row.get(column).map(json_to_raw).unwrap_or_default()),
            Extractor::Constant { value } => Ok(json_to_raw(value)),
            Extractor::Concat { parts, separator } => {
                let mut pieces = Vec::with_capacity(parts.len());
                for part in parts {
                    if let Some(first) = part.extract(row)?.first() {
                        pieces.push(first.canonical_text());
                    }
                }
                if pieces.is_empty() {
                    Ok(Vec::new())
                } else {
                    Ok(vec![RawValue::Text(pieces.join(separator))])
                }
            }
            Extractor::FirstOf { candidates } => {
                for candidate in candidates {
                    let values = candidate.extract(row)?;
                    if !values.is_empty() {
                        return Ok(values);
                    }
                }
                Ok(Vec::new())
            }
            Extractor::Pipeline { source, steps } => {
                let mut values = source.extract(row)?;
                for step in steps {
                    let mut next = Vec::with_capacity(values.len());
                    for value in values {
                        next.extend(step.apply(value)?);
                    }
                    values = next;
                }
                Ok(values)
            }
        }
    }
}

/// Converts a JSON cell into zero or more raw values.
pub fn json_to_raw(value: &JsonValue) -> Vec<RawValue> {
    match value {
        JsonValue::Null => Vec::new(),
        JsonValue::String(s) => vec![RawValue::Text(s.clone())],
        JsonValue::Bool(b) => vec![RawValue::Boolean(*b)],
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => vec![RawValue::Integer(i)],
            None => n.as_f64().map(RawValue::Float).into_iter().collect(),
        },
        JsonValue::Array(items) => items.iter().flat_map(json_to_raw).collect(),
        JsonValue::Object(_) => vec![RawValue::Text(value.to_string())],
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Transform {
    Trim,
    Lowercase,
    Uppercase,
    Prefix { value: String },
    Suffix { value: String },
    Replace { from: String, to: String },
    /// Splits text into several values.
    Split { separator: String },
    ParseInt,
    ParseFloat,
    ParseBool,
    /// Parses a date with a chrono format string; emits ISO-8601 (`%Y-%m-%d`).
    ParseDate { format: String },
    /// Parses a timestamp; values without an offset are taken as UTC. Emits RFC 3339.
    ParseDatetime { format: String },
    Base64Decode,
}

impl Transform {
    pub fn apply(&self, value: RawValue) -> Result<Vec<RawValue>, String> {
        let text = value.canonical_text();
        let out = match self {
            Transform::Trim => RawValue::Text(text.trim().to_string()),
            Transform::Lowercase => RawValue::Text(text.to_lowercase()),
            Transform::Uppercase => RawValue::Text(text.to_uppercase()),
            Transform::Prefix { value } => RawValue::Text(format!("{value}{text}")),
            Transform::Suffix { value } => RawValue::Text(format!("{text}{value}")),
            Transform::Replace { from, to } => RawValue::Text(text.replace(from.as_str(), to)),
            Transform::Split { separator } => {
                return Ok(text
                    .split(separator.as_str())
                    .map(|piece| RawValue::Text(piece.to_string()))
                    .collect());
            }
            _ if text.trim().is_empty() && !matches!(value, RawValue::Binary(_)) => {
                return Ok(Vec::new());
            }
            Transform::ParseInt => match value {
                RawValue::Integer(_) => value,
                RawValue::Float(f) => RawValue::Integer(
                    float_to_i64(f).ok_or_else(|| format!("{f} is not an integer in range"))?,
                ),
                _ => RawValue::Integer(
                    text.trim()
                        .parse::<i64>()
                        .map_err(|e| format!("'{text}' is not an integer: {e}"))?,
                ),
            },
            Transform::ParseFloat => match value {
                RawValue::Float(_) => value,
                RawValue::Integer(i) => RawValue::Float(i as f64),
                _ => RawValue::Float(
                    text.trim()
                        .parse::<f64>()
                        .map_err(|e| format!("'{text}' is not a number: {e}"))?,
                ),
            },
            Transform::ParseBool => RawValue::Boolean(parse_bool(&text)?),
            Transform::ParseDate { format } => {
                let date = NaiveDate::parse_from_str(text.trim(), format)
                    .map_err(|e| format!("'{text}' does not match date format '{format}': {e}"))?;
                RawValue::Text(date.format("%Y-%m-%d").to_string())
            }
            Transform::ParseDatetime { format } => {
                RawValue::Text(parse_datetime(text.trim(), format)?.to_rfc3339())
            }
            Transform::Base64Decode => match value {
                RawValue::Binary(_) => value,
                _ => RawValue::Binary(
                    BASE64
                        .decode(text.trim())
                        .map_err(|e| format!("invalid base64 payload: {e}"))?,
                ),
            },
        };
        Ok(vec![out])
    }
}

pub(crate) fn parse_bool(text: &str) -> Result<bool, String> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Ok(true),
        "false" | "f" | "no" | "n" | "0" => Ok(false),
        other => Err(format!("'{other}' is not a boolean")),
    }
}

fn parse_datetime(text: &str, format: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(with_offset) = DateTime::parse_from_str(text, format) {
        return Ok(with_offset.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, format)
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("'{text}' does not match datetime format '{format}': {e}"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// The column holds a non-null, non-blank value.
    Present { column: String },
    Equals { column: String, value: String },
    OneOf { column: String, values: Vec<String> },
    Not { condition: Box<Condition> },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
}

impl Condition {
    pub fn evaluate(&self, row: &Row) -> bool {
        match self {
            Condition::Present { column } => !column_texts(row, column).is_empty(),
            Condition::Equals { column, value } => {
                column_texts(row, column).iter().any(|text| text == value)
            }
            Condition::OneOf { column, values } => column_texts(row, column)
                .iter()
                .any(|text| values.contains(text)),
            Condition::Not { condition } => !condition.evaluate(row),
            Condition::All { conditions } => conditions.iter().all(|c| c.evaluate(row)),
            Condition::Any { conditions } => conditions.iter().any(|c| c.evaluate(row)),
        }
    }
}

fn column_texts(row: &Row, column: &str) -> Vec<String> {
    row.get(column)
        .map(json_to_raw)
        .unwrap_or_default()
        .into_iter()
        .filter(|value| !value.is_blank())
        .map(|value| value.canonical_text())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: JsonValue) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_column_skips_null_and_blank() {
        let r = row(json!({"a": null, "b": "   ", "c": "x", "d": 7}));
        assert!(Extractor::column("a").extract(&r).unwrap().is_empty());
        assert!(Extractor::column("b").extract(&r).unwrap().is_empty());
        assert!(Extractor::column("missing").extract(&r).unwrap().is_empty());
        assert_eq!(Extractor::column("c").extract(&r).unwrap(), vec![RawValue::from("x")]);
        assert_eq!(Extractor::column("d").extract(&r).unwrap(), vec![RawValue::Integer(7)]);
    }

    #[test]
    fn test_pipeline_from_json() {
        let extractor: Extractor = serde_json::from_value(json!({
            "kind": "pipeline",
            "source": {"kind": "column", "column": "tags"},
            "steps": [{"op": "split", "separator": ";"}, {"op": "trim"}, {"op": "uppercase"}]
        }))
        .unwrap();
        let values = extractor.extract(&row(json!({"tags": "a; b;"}))).unwrap();
        assert_eq!(values, vec![RawValue::from("A"), RawValue::from("B")]);
    }

    #[test]
    fn test_concat_and_first_of() {
        let r = row(json!({"first": "Ada", "last": "Lovelace", "nick": ""}));
        let concat = Extractor::Concat {
            parts: vec![Extractor::column("first"), Extractor::column("last")],
            separator: " ".into(),
        };
        assert_eq!(concat.extract(&r).unwrap(), vec![RawValue::from("Ada Lovelace")]);

        let first_of = Extractor::FirstOf {
            candidates: vec![Extractor::column("nick"), Extractor::column("first")],
        };
        assert_eq!(first_of.extract(&r).unwrap(), vec![RawValue::from("Ada")]);
    }

    #[test]
    fn test_parse_transforms() {
        assert_eq!(
            Transform::ParseInt.apply(RawValue::from(" 42 ")).unwrap(),
            vec![RawValue::Integer(42)]
        );
        assert!(Transform::ParseInt.apply(RawValue::from("x")).is_err());
        assert_eq!(
            Transform::ParseInt.apply(RawValue::Float(7.0)).unwrap(),
            vec![RawValue::Integer(7)]
        );
        assert!(Transform::ParseInt.apply(RawValue::Float(1e20)).is_err());
        assert_eq!(
            Transform::ParseDate {
                format: "%m/%d/%Y".into()
            }
            .apply(RawValue::from("07/04/2021"))
            .unwrap(),
            vec![RawValue::from("2021-07-04")]
        );
        assert_eq!(
            Transform::ParseDatetime {
                format: "%Y-%m-%d %H:%M:%S".into()
            }
            .apply(RawValue::from("2021-07-04 10:00:00"))
            .unwrap(),
            vec![RawValue::from("2021-07-04T10:00:00+00:00")]
        );
        assert_eq!(
            Transform::Base64Decode.apply(RawValue::from("aGk=")).unwrap(),
            vec![RawValue::Binary(b"hi".to_vec())]
        );
        assert!(Transform::ParseBool.apply(RawValue::from("")).unwrap().is_empty());
    }

    #[test]
    fn test_conditions() {
        let r = row(json!({"status": "active", "count": 3}));
        let condition: Condition = serde_json::from_value(json!({
            "kind": "all",
            "conditions": [
                {"kind": "equals", "column": "status", "value": "active"},
                {"kind": "one_of", "column": "count", "values": ["1", "3"]},
                {"kind": "not", "condition": {"kind": "present", "column": "deleted"}}
            ]
        }))
        .unwrap();
        assert!(condition.evaluate(&r));
        assert!(!Condition::Present { column: "nope".into() }.evaluate(&r));
    }
}
