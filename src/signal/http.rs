use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{ForecastSource, SourceSchema};
use crate::config::SourceConfig;
use crate::error::{EngineError, EngineResult};

/// Generic JSON-over-HTTP provider driven by a declared schema.
pub struct HttpForecastSource {
    id: String,
    url_template: String,
    schema: SourceSchema,
    is_ensemble: bool,
    client: reqwest::Client,
}

impl HttpForecastSource {
    pub fn from_config(cfg: &SourceConfig, timeout: Duration) -> EngineResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            id: cfg.id.clone(),
            url_template: cfg.url_template.clone(),
            schema: cfg.schema.clone(),
            is_ensemble: cfg.is_ensemble,
            client,
        })
    }

    pub fn endpoint(&self, segment_id: &str, target_time: DateTime<Utc>) -> EngineResult<url::Url> {
        let raw = self
            .url_template
            .replace("{segment}", segment_id)
            .replace("{date}", &target_time.format("%Y-%m-%d").to_string());
        url::Url::parse(&raw)
            .map_err(|e| EngineError::external(&self.id, format!("bad endpoint {raw}: {e}")))
    }
}

#[async_trait]
impl ForecastSource for HttpForecastSource {
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
        let url = self.endpoint(segment_id, target_time)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| EngineError::external(&self.id, e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::NO_CONTENT {
            return Err(EngineError::data_unavailable(
                segment_id,
                format!("{} answered {}", self.id, status),
            ));
        }
        if !status.is_success() {
            return Err(EngineError::external(
                &self.id,
                format!("unexpected status {status}"),
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| EngineError::external(&self.id, format!("invalid json: {e}")))?;
        Ok(vec![body])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn endpoint_substitutes_segment_and_date() {
        let cfg = SourceConfig {
            id: "om".to_string(),
            url_template: "https://api.example.com/v1/{segment}?date={date}".to_string(),
            is_ensemble: false,
            schema: SourceSchema::default(),
        };
        let source = HttpForecastSource::from_config(&cfg, Duration::from_secs(1)).unwrap();
        let when = Utc.with_ymd_and_hms(2026, 1, 5, 18, 0, 0).unwrap();
        let url = source.endpoint("CHI", when).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/CHI?date=2026-01-05");
    }
}
