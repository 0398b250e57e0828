use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use super::SourceSchema;
use crate::error::{EngineError, EngineResult};
use crate::model::ForecastRecord;

/// Values outside this band (degrees Fahrenheit) are feed errors, not forecasts.
const PLAUSIBLE_F: std::ops::RangeInclusive<f64> = -100.0..=150.0;

/// Convert one raw provider payload into records for `segment_id` at `target_time`.
pub fn normalize(
    source_id: &str,
    schema: &SourceSchema,
    raw: &Value,
    segment_id: &str,
    target_time: DateTime<Utc>,
    retrieved_at: DateTime<Utc>,
) -> EngineResult<Vec<ForecastRecord>> {
    let entries = entries_at(raw, &schema.records_path).ok_or_else(|| {
        EngineError::data_unavailable(
            segment_id,
            format!("{source_id}: payload has no entries at '{}'", schema.records_path),
        )
    })?;

    let target_date = target_time.date_naive();
    let mut records = Vec::with_capacity(entries.len());
    for entry in entries {
        if let Some(field) = &schema.target_time_field {
            if let Some(entry_time) = lookup(entry, field).and_then(as_timestamp) {
                if entry_time.date_naive() != target_date {
                    continue;
                }
            }
        }

        let members: Option<Vec<f64>> = schema
            .ensemble_field
            .as_deref()
            .and_then(|field| lookup(entry, field))
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(as_number)
                    .map(|v| schema.unit.to_fahrenheit(v))
                    .filter(|v| PLAUSIBLE_F.contains(v))
                    .collect::<Vec<_>>()
            })
            .filter(|m| !m.is_empty());

        let point = lookup(entry, &schema.point_field)
            .and_then(as_number)
            .map(|v| schema.unit.to_fahrenheit(v))
            .or_else(|| {
                members
                    .as_ref()
                    .map(|m| m.iter().sum::<f64>() / m.len() as f64)
            });
        let Some(point) = point.filter(|v| v.is_finite() && PLAUSIBLE_F.contains(v)) else {
            continue;
        };

        let issued_at = schema
            .issued_at_field
            .as_deref()
            .and_then(|field| lookup(entry, field))
            .and_then(as_timestamp)
            .unwrap_or(retrieved_at);

        records.push(ForecastRecord::new(
            source_id,
            segment_id,
            target_time,
            point,
            members,
            issued_at,
            retrieved_at,
        ));
    }

    if records.is_empty() {
        return Err(EngineError::data_unavailable(
            segment_id,
            format!("{source_id}: no entries for {target_date}"),
        ));
    }
    Ok(records)
}

fn entries_at<'a>(raw: &'a Value, path: &str) -> Option<Vec<&'a Value>> {
    let node = if path.trim().is_empty() {
        raw
    } else {
        lookup(raw, path)?
    };
    match node {
        Value::Array(items) if !items.is_empty() => Some(items.iter().collect()),
        Value::Object(map) if !map.is_empty() => Some(vec![node]),
        _ => None,
    }
}

pub(crate) fn lookup<'a>(value: &'a Value, dotted: &str) -> Option<&'a Value> {
    let pointer = format!("/{}", dotted.trim().replace('.', "/"));
    value.pointer(&pointer)
}

pub(crate) fn as_number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

pub(crate) fn as_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}
