//! Coercion of extracted values to a property type's primitive datatype.

use crate::catalog::PrimitiveKind;
use crate::errors::{Result, ShuttleError};
use crate::extract::parse_bool;
use crate::models::RawValue;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Value as SqlValue;
use uuid::Uuid;

/// Normalizes `value` to the representation stored for `kind`.
///
/// Mismatches carry no entity; callers attach it with [`ShuttleError::for_entity`].
/// Equal values in different spellings (`"42"` and `42` for an integer property)
/// normalize to the same result, and therefore to the same content hash.
pub fn coerce(kind: PrimitiveKind, property_type_id: Uuid, value: &RawValue) -> Result<RawValue> {
    let mismatch = |detail: String| ShuttleError::TypeMismatch {
        entity_set_id: Uuid::nil(),
        entity_id: String::new(),
        property_type_id,
        expected: format!("{kind:?}"),
        value: detail,
    };
    let text = || value.canonical_text();

    let coerced = match (kind, value) {
        (PrimitiveKind::Binary, _) => RawValue::Binary(to_bytes(property_type_id, value)?),
        (_, RawValue::Binary(_)) => return Err(mismatch("<binary>".to_string())),
        (PrimitiveKind::String, _) => RawValue::Text(text()),
        (PrimitiveKind::Int16 | PrimitiveKind::Int32 | PrimitiveKind::Int64, _) => {
            let parsed = match value {
                RawValue::Integer(i) => *i,
                RawValue::Float(f) => float_to_i64(*f).ok_or_else(|| mismatch(f.to_string()))?,
                _ => text().trim().parse::<i64>().map_err(|_| mismatch(text()))?,
            };
            let in_range = match kind {
                PrimitiveKind::Int16 => i16::try_from(parsed).is_ok(),
                PrimitiveKind::Int32 => i32::try_from(parsed).is_ok(),
                _ => true,
            };
            if !in_range {
                return Err(mismatch(parsed.to_string()));
            }
            RawValue::Integer(parsed)
        }
        (PrimitiveKind::Double, RawValue::Float(f)) => RawValue::Float(*f),
        (PrimitiveKind::Double, RawValue::Integer(i)) => RawValue::Float(*i as f64),
        (PrimitiveKind::Double, _) => {
            RawValue::Float(text().trim().parse::<f64>().map_err(|_| mismatch(text()))?)
        }
        (PrimitiveKind::Boolean, RawValue::Boolean(b)) => RawValue::Boolean(*b),
        (PrimitiveKind::Boolean, _) => RawValue::Boolean(parse_bool(&text()).map_err(mismatch)?),
        (PrimitiveKind::Date, _) => {
            let date = NaiveDate::parse_from_str(text().trim(), "%Y-%m-%d")
                .map_err(|_| mismatch(text()))?;
            RawValue::Text(date.format("%Y-%m-%d").to_string())
        }
        (PrimitiveKind::DateTimeOffset, _) => {
            let parsed = DateTime::parse_from_rfc3339(text().trim()).map_err(|_| mismatch(text()))?;
            RawValue::Text(parsed.with_timezone(&Utc).to_rfc3339())
        }
        (PrimitiveKind::Guid, _) => {
            let parsed = Uuid::parse_str(text().trim()).map_err(|_| mismatch(text()))?;
            RawValue::Text(parsed.hyphenated().to_string())
        }
    };
    Ok(coerced)
}

/// Binary representation of a value bound for a binary property. Text is read as base64.
pub fn to_bytes(property_type_id: Uuid, value: &RawValue) -> Result<Vec<u8>> {
    match value {
        RawValue::Binary(bytes) => Ok(bytes.clone()),
        RawValue::Text(text) => BASE64
            .decode(text.trim())
            .map_err(|_| ShuttleError::TypeMismatch {
                entity_set_id: Uuid::nil(),
                entity_id: String::new(),
                property_type_id,
                expected: "Binary".to_string(),
                value: text.chars().take(64).collect(),
            }),
        other => Err(ShuttleError::TypeMismatch {
            entity_set_id: Uuid::nil(),
            entity_id: String::new(),
            property_type_id,
            expected: "Binary".to_string(),
            value: format!("<{}>", other.type_name()),
        }),
    }
}

/// Exact integer value of `f`, if it has one representable as `i64`.
pub(crate) fn float_to_i64(f: f64) -> Option<i64> {
    // i64::MAX rounds up to 2^63 as f64, so the upper bound is exclusive.
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

pub fn to_sql(value: RawValue) -> SqlValue {
    match value {
        RawValue::Text(s) => SqlValue::Text(s),
        RawValue::Integer(i) => SqlValue::Integer(i),
        RawValue::Float(f) => SqlValue::Real(f),
        RawValue::Boolean(b) => SqlValue::Integer(i64::from(b)),
        RawValue::Binary(bytes) => SqlValue::Blob(bytes),
    }
}
