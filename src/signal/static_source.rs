use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;

use super::{ForecastSource, SourceSchema};
use crate::error::{EngineError, EngineResult};

/// Serves fixed payloads keyed by (segment, date). Used for replays and tests.
pub struct StaticForecastSource {
    id: String,
    schema: SourceSchema,
    is_ensemble: bool,
    payloads: HashMap<(String, NaiveDate), Vec<Value>>,
    failure: Option<String>,
    delay: Option<Duration>,
}

impl StaticForecastSource {
    pub fn new(id: impl Into<String>, schema: SourceSchema) -> Self {
        Self {
            id: id.into(),
            schema,
            is_ensemble: false,
            payloads: HashMap::new(),
            failure: None,
            delay: None,
        }
    }

    pub fn ensemble(mut self) -> Self {
        self.is_ensemble = true;
        self
    }

    pub fn with_payload(mut self, segment_id: &str, date: NaiveDate, payload: Value) -> Self {
        self.payloads
            .entry((segment_id.to_string(), date))
            .or_default()
            .push(payload);
        self
    }

    /// Every fetch fails with `ExternalFailure`.
    pub fn failing(mut self, detail: impl Into<String>) -> Self {
        self.failure = Some(detail.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl ForecastSource for StaticForecastSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    fn schema(&self) -> &SourceSchema {
        &self.schema
    }

    fn is_ensemble(&self) -> bool {
        self.is_ensemble
    }

    async fn fetch(
        &self,
        segment_id: &str,
        target_time: DateTime<Utc>,
    ) -> EngineResult<Vec<Value>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(detail) = &self.failure {
            return Err(EngineError::external(&self.id, detail.clone()));
        }
        Ok(self
            .payloads
            .get(&(segment_id.to_string(), target_time.date_naive()))
            .cloned()
            .unwrap_or_default())
    }
}
