use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{ObservationConfig, ObservationSourceConfig};
use crate::decision::ReasonCode;
use crate::error::{EngineError, EngineResult};
use crate::model::{Side, Strike};
use crate::signal::normalizer::{as_number, as_timestamp, lookup};
use crate::signal::TemperatureUnit;

/// Which daily extreme a segment's contracts settle on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Extreme {
    #[default]
    High,
    Low,
}

impl Extreme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Extreme::High => "high",
            Extreme::Low => "low",
        }
    }
}

/// Running extreme of the underlying so far on one local day.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub value: f64,
    pub observed_at: DateTime<Utc>,
}

/// Live station readings for the current day.
#[async_trait]
pub trait ObservationSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Running extreme on `date` (segment-local). `Ok(None)` before the first reading.
    async fn observed_extreme(
        &self,
        segment_id: &str,
        date: NaiveDate,
        extreme: Extreme,
    ) -> EngineResult<Option<Observation>>;
}

/// Fixed readings keyed by (segment, date, extreme). Used for replays and tests.
#[derive(Default)]
pub struct StaticObservationSource {
    readings: HashMap<(String, NaiveDate, Extreme), Observation>,
    failure: Option<String>,
}

impl StaticObservationSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reading(
        mut self,
        segment_id: &str,
        date: NaiveDate,
        extreme: Extreme,
        observation: Observation,
    ) -> Self {
        self.readings
            .insert((segment_id.to_string(), date, extreme), observation);
        self
    }

    pub fn failing(mut self, detail: impl Into<String>) -> Self {
        self.failure = Some(detail.into());
        self
    }
}

#[async_trait]
impl ObservationSource for StaticObservationSource {
    fn source_id(&self) -> &str {
        "static"
    }

    async fn observed_extreme(
        &self,
        segment_id: &str,
        date: NaiveDate,
        extreme: Extreme,
    ) -> EngineResult<Option<Observation>> {
        if let Some(detail) = &self.failure {
            return Err(EngineError::external("static", detail.clone()));
        }
        Ok(self
            .readings
            .get(&(segment_id.to_string(), date, extreme))
            .copied())
    }
}

/// JSON-over-HTTP station feed. The endpoint template takes `{segment}`,
/// `{date}` and `{extreme}`.
pub struct HttpObservationSource {
    id: String,
    url_template: String,
    value_field: String,
    observed_at_field: Option<String>,
    unit: TemperatureUnit,
    client: reqwest::Client,
}

impl HttpObservationSource {
    pub fn from_config(cfg: &ObservationSourceConfig, timeout: Duration) -> EngineResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            id: cfg.id.clone(),
            url_template: cfg.url_template.clone(),
            value_field: cfg.value_field.clone(),
            observed_at_field: cfg.observed_at_field.clone(),
            unit: cfg.unit,
            client,
        })
    }

    pub fn endpoint(
        &self,
        segment_id: &str,
        date: NaiveDate,
        extreme: Extreme,
    ) -> EngineResult<url::Url> {
        let raw = self
            .url_template
            .replace("{segment}", segment_id)
            .replace("{date}", &date.format("%Y-%m-%d").to_string())
            .replace("{extreme}", extreme.as_str());
        url::Url::parse(&raw)
            .map_err(|e| EngineError::external(&self.id, format!("bad endpoint {raw}: {e}")))
    }

    /// Pull the reading out of a payload. A missing or implausible value is no reading.
    pub fn parse(&self, body: &Value, fetched_at: DateTime<Utc>) -> Option<Observation> {
        let value = lookup(body, &self.value_field)
            .and_then(as_number)
            .map(|v| self.unit.to_fahrenheit(v))
            .filter(|v| (-100.0..=150.0).contains(v))?;
        let observed_at = self
            .observed_at_field
            .as_deref()
            .and_then(|field| lookup(body, field))
            .and_then(as_timestamp)
            .unwrap_or(fetched_at);
        Some(Observation { value, observed_at })
    }
}

#[async_trait]
impl ObservationSource for HttpObservationSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    async fn observed_extreme(
        &self,
        segment_id: &str,
        date: NaiveDate,
        extreme: Extreme,
    ) -> EngineResult<Option<Observation>> {
        let url = self.endpoint(segment_id, date, extreme)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| EngineError::external(&self.id, e.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
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
        Ok(self.parse(&body, Utc::now()))
    }
}

/// The side an observed running extreme has already locked in, if any.
///
/// A running high only rises and a running low only falls, so only one
/// direction of each strike can be settled early.
pub fn outcome_determined(strike: &Strike, extreme: Extreme, observed: f64) -> Option<Side> {
    match (extreme, *strike) {
        (Extreme::High, Strike::Above { threshold }) if observed > threshold => Some(Side::Yes),
        (Extreme::High, Strike::Below { threshold }) if observed >= threshold => Some(Side::No),
        (Extreme::High, Strike::Between { high, .. }) if observed > high => Some(Side::No),
        (Extreme::Low, Strike::Above { threshold }) if observed <= threshold => Some(Side::No),
        (Extreme::Low, Strike::Below { threshold }) if observed < threshold => Some(Side::Yes),
        (Extreme::Low, Strike::Between { low, .. }) if observed < low => Some(Side::No),
        _ => None,
    }
}

/// Segment-local state of the current day, resolved once per scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SameDay {
    pub extreme: Extreme,
    /// Local wall-clock hour with minutes as a fraction.
    pub local_hour: f64,
    pub observed: Option<f64>,
}

impl SameDay {
    pub fn at(extreme: Extreme, local_now: DateTime<Utc>, observed: Option<f64>) -> Self {
        Self {
            extreme,
            local_hour: local_now.hour() as f64 + local_now.minute() as f64 / 60.0,
            observed,
        }
    }
}

/// Blocks new entries on same-day contracts once observations have settled
/// them or the day's extreme has likely passed.
#[derive(Debug, Clone)]
pub struct ObservationGate {
    cfg: ObservationConfig,
}

impl ObservationGate {
    pub fn new(cfg: ObservationConfig) -> Self {
        Self { cfg }
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    pub fn past_extreme(&self, day: &SameDay, forecast_mean: f64) -> bool {
        let margin = self.cfg.extreme_margin;
        match day.extreme {
            Extreme::High => {
                day.local_hour >= self.cfg.high_cutoff_hour as f64
                    || day.observed.is_some_and(|o| o >= forecast_mean - margin)
            }
            Extreme::Low => {
                day.local_hour >= self.cfg.low_cutoff_hour as f64
                    || day.observed.is_some_and(|o| o <= forecast_mean + margin)
            }
        }
    }

    /// `None` when a new entry may proceed.
    pub fn check(
        &self,
        strike: &Strike,
        day: &SameDay,
        forecast_mean: f64,
    ) -> Option<(ReasonCode, String)> {
        if !self.cfg.enabled {
            return None;
        }
        if let Some(observed) = day.observed {
            if let Some(side) = outcome_determined(strike, day.extreme, observed) {
                return Some((
                    ReasonCode::ObservationOutcomeDetermined,
                    format!(
                        "observed {} {:.1} already settles {}",
                        day.extreme.as_str(),
                        observed,
                        side
                    ),
                ));
            }
        }
        if self.past_extreme(day, forecast_mean) {
            return Some((
                ReasonCode::ObservationPastExtreme,
                format!(
                    "{} of day likely reached (local hour {:.1}, observed {}, forecast {:.1})",
                    day.extreme.as_str(),
                    day.local_hour,
                    day.observed
                        .map(|o| format!("{o:.1}"))
                        .unwrap_or_else(|| "none".to_string()),
                    forecast_mean
                ),
            ));
        }
        None
    }
}
