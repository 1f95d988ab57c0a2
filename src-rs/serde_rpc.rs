use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::Deserializer;
use serde::{de, Deserialize};
use serde_json::Value;

/// Accepts RFC 3339 timestamps as well as the zone-less form Postgres emits
/// for `timestamp` columns (read as UTC). Empty strings decode as `None`.
pub fn de_opt_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) if text.trim().is_empty() => Ok(None),
        Some(Value::String(text)) => parse_timestamp(text.trim())
            .map(Some)
            .map_err(de::Error::custom),
        Some(other) => Err(de::Error::custom(format!(
            "expected timestamp string, got {other}"
        ))),
    }
}

pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(value) = DateTime::parse_from_rfc3339(text) {
        return Ok(value.with_timezone(&Utc));
    }
    if let Ok(value) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Ok(value.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(value) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(value.and_utc());
        }
    }
    Err(format!("invalid timestamp: {text}"))
}

/// Decodes a usage count. Postgres `bigint` and `numeric` results may arrive
/// as JSON numbers or strings; negative counts are rejected and counts beyond
/// `u32::MAX` saturate.
pub fn value_to_count(value: &Value) -> Result<u32, String> {
    let count = match value {
        Value::Null => return Ok(0),
        Value::Number(number) => {
            if let Some(value) = number.as_u64() {
                value
            } else if let Some(value) = number.as_i64() {
                return Err(format!("negative count: {value}"));
            } else if let Some(value) = number.as_f64() {
                f64_to_u64(value)?
            } else {
                return Err(format!("unsupported JSON number: {number}"));
            }
        }
        Value::String(text) => {
            let text = text.trim();
            if let Ok(value) = text.parse::<u64>() {
                value
            } else if let Ok(value) = text.parse::<f64>() {
                f64_to_u64(value)?
            } else {
                return Err(format!("invalid numeric string: {text}"));
            }
        }
        // scalar functions called through PostgREST sometimes come back wrapped
        Value::Array(values) if values.len() == 1 => return value_to_count(&values[0]),
        Value::Object(map) if map.len() == 1 => {
            return map
                .values()
                .next()
                .map(value_to_count)
                .unwrap_or(Ok(0))
        }
        other => return Err(format!("expected count, got {other}")),
    };

    Ok(u32::try_from(count).unwrap_or(u32::MAX))
}

fn f64_to_u64(value: f64) -> Result<u64, String> {
    if !value.is_finite() || value < 0.0 {
        return Err(format!("invalid count: {value}"));
    }
    if value.fract() != 0.0 {
        return Err(format!("non-integer count: {value}"));
    }
    Ok(value.min(u64::MAX as f64) as u64)
}
