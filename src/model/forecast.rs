use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One normalized forecast for a (segment, target time) pair.
///
/// Fields are private so a record cannot change after the normalizer emits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    source_id: String,
    segment_id: String,
    target_time: DateTime<Utc>,
    point_estimate: f64,
    ensemble_members: Option<Vec<f64>>,
    issued_at: DateTime<Utc>,
    retrieved_at: DateTime<Utc>,
}

impl ForecastRecord {
    pub fn new(
        source_id: impl Into<String>,
        segment_id: impl Into<String>,
        target_time: DateTime<Utc>,
        point_estimate: f64,
        ensemble_members: Option<Vec<f64>>,
        issued_at: DateTime<Utc>,
        retrieved_at: DateTime<Utc>,
    ) -> Self {
        let ensemble_members = ensemble_members
            .map(|m| m.into_iter().filter(|v| v.is_finite()).collect::<Vec<_>>())
            .filter(|m| !m.is_empty());
        Self {
            source_id: source_id.into(),
            segment_id: segment_id.into(),
            target_time,
            point_estimate,
            ensemble_members,
            issued_at,
            retrieved_at,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn segment_id(&self) -> &str {
        &self.segment_id
    }

    pub fn target_time(&self) -> DateTime<Utc> {
        self.target_time
    }

    pub fn point_estimate(&self) -> f64 {
        self.point_estimate
    }

    pub fn ensemble_members(&self) -> Option<&[f64]> {
        self.ensemble_members.as_deref()
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn retrieved_at(&self) -> DateTime<Utc> {
        self.retrieved_at
    }

    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        ((now - self.issued_at).num_seconds() as f64 / 3600.0).max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceProfile {
    pub source_id: String,
    pub reliability_score: f64,
    pub is_ensemble: bool,
    pub member_count: usize,
    pub rmse: Option<f64>,
}

impl SourceProfile {
    pub fn new(source_id: impl Into<String>, is_ensemble: bool) -> Self {
        Self {
            source_id: source_id.into(),
            reliability_score: 1.0,
            is_ensemble,
            member_count: 0,
            rmse: None,
        }
    }

    /// Inverse-variance reliability relative to a reference RMSE.
    /// A source with no history keeps a neutral score of 1.0.
    pub fn apply_rmse(&mut self, rmse: f64, reference_rmse: f64, max_rmse: f64) {
        if !rmse.is_finite() {
            return;
        }
        let clamped = rmse.clamp(0.5, max_rmse.max(0.5));
        let reference = reference_rmse.clamp(0.5, max_rmse.max(0.5));
        self.rmse = Some(rmse);
        self.reliability_score = (reference * reference) / (clamped * clamped);
    }
}
