pub mod http;
pub mod normalizer;
pub mod static_source;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::model::ForecastRecord;

pub use http::HttpForecastSource;
pub use normalizer::normalize;
pub use static_source::StaticForecastSource;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureUnit {
    #[default]
    Fahrenheit,
    Celsius,
}

impl TemperatureUnit {
    pub fn to_fahrenheit(self, value: f64) -> f64 {
        match self {
            TemperatureUnit::Fahrenheit => value,
            TemperatureUnit::Celsius => value * 9.0 / 5.0 + 32.0,
        }
    }
}

/// Declared shape of a provider payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSchema {
    /// Dotted path to the entry list. Empty means the payload itself.
    pub records_path: String,
    pub point_field: String,
    pub ensemble_field: Option<String>,
    pub issued_at_field: Option<String>,
    pub target_time_field: Option<String>,
    pub unit: TemperatureUnit,
}

impl Default for SourceSchema {
    fn default() -> Self {
        Self {
            records_path: String::new(),
            point_field: "value".to_string(),
            ensemble_field: Some("members".to_string()),
            issued_at_field: Some("issued_at".to_string()),
            target_time_field: Some("target_time".to_string()),
            unit: TemperatureUnit::Fahrenheit,
        }
    }
}

/// A forecast provider. Implementations only fetch raw payloads; the shared
/// normalizer turns them into records.
#[async_trait]
pub trait ForecastSource: Send + Sync {
    fn source_id(&self) -> &str;

    fn schema(&self) -> &SourceSchema;

    fn is_ensemble(&self) -> bool {
        false
    }

    async fn fetch(&self, segment_id: &str, target_time: DateTime<Utc>) -> EngineResult<Vec<Value>>;
}

/// Fetch and normalize one source. Payloads that normalize to nothing are skipped;
/// an overall empty result is `DataUnavailable`.
pub async fn fetch_records(
    source: &dyn ForecastSource,
    segment_id: &str,
    target_time: DateTime<Utc>,
    retrieved_at: DateTime<Utc>,
) -> EngineResult<Vec<ForecastRecord>> {
    let payloads = source.fetch(segment_id, target_time).await?;
    let mut records = Vec::new();
    for payload in &payloads {
        match normalize(
            source.source_id(),
            source.schema(),
            payload,
            segment_id,
            target_time,
            retrieved_at,
        ) {
            Ok(mut batch) => records.append(&mut batch),
            Err(EngineError::DataUnavailable { detail, .. }) => {
                tracing::debug!(
                    source = source.source_id(),
                    segment = segment_id,
                    detail = %detail,
                    "payload skipped"
                );
            }
            Err(e) => return Err(e),
        }
    }
    if records.is_empty() {
        return Err(EngineError::data_unavailable(
            segment_id,
            format!("source {} returned no usable records", source.source_id()),
        ));
    }
    Ok(records)
}
