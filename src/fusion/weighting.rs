use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::model::{ForecastRecord, SourceProfile};

/// RMSE that maps to a reliability score of 1.0.
pub const REFERENCE_RMSE: f64 = 2.0;

#[derive(Debug, Clone, PartialEq)]
pub struct WeightedRecord {
    pub record: ForecastRecord,
    pub weight: f64,
}

#[derive(Debug, Clone)]
pub struct SourceWeighting {
    profiles: HashMap<String, SourceProfile>,
    half_life_hours: f64,
}

impl SourceWeighting {
    pub fn new(half_life_hours: f64) -> Self {
        Self {
            profiles: HashMap::new(),
            half_life_hours: half_life_hours.max(1e-6),
        }
    }

    pub fn register(&mut self, source_id: &str, is_ensemble: bool) {
        self.profiles
            .entry(source_id.to_string())
            .or_insert_with(|| SourceProfile::new(source_id, is_ensemble));
    }

    pub fn profiles(&self) -> Vec<SourceProfile> {
        let mut out: Vec<SourceProfile> = self.profiles.values().cloned().collect();
        out.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        out
    }

    /// Refresh a source's reliability from its settled RMSE.
    pub fn update_rmse(&mut self, source_id: &str, rmse: f64, max_rmse: f64) {
        let profile = self
            .profiles
            .entry(source_id.to_string())
            .or_insert_with(|| SourceProfile::new(source_id, false));
        profile.apply_rmse(rmse, REFERENCE_RMSE, max_rmse);
    }

    /// Track the widest ensemble seen from each source.
    pub fn observe(&mut self, records: &[ForecastRecord]) {
        for record in records {
            let Some(members) = record.ensemble_members() else {
                continue;
            };
            let profile = self
                .profiles
                .entry(record.source_id().to_string())
                .or_insert_with(|| SourceProfile::new(record.source_id(), true));
            profile.is_ensemble = true;
            profile.member_count = profile.member_count.max(members.len());
        }
    }

    pub fn reliability(&self, source_id: &str) -> f64 {
        self.profiles
            .get(source_id)
            .map(|p| p.reliability_score)
            .filter(|r| r.is_finite() && *r > 0.0)
            .unwrap_or(1.0)
    }

    pub fn recency_factor(&self, age_hours: f64) -> f64 {
        (-std::f64::consts::LN_2 * age_hours.max(0.0) / self.half_life_hours).exp()
    }

    pub fn weigh(&self, records: Vec<ForecastRecord>, now: DateTime<Utc>) -> Vec<WeightedRecord> {
        records
            .into_iter()
            .map(|record| {
                let recency = self.recency_factor(record.age_hours(now));
                let weight = self.reliability(record.source_id()) * recency;
                WeightedRecord { record, weight }
            })
            .collect()
    }
}

/// First and third quartiles with linear interpolation.
pub fn quartiles(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Some((percentile_sorted(&sorted, 0.25), percentile_sorted(&sorted, 0.75)))
}

pub(crate) fn percentile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Drop ensemble members outside the same IQR fences used for point
/// estimates. Sets too small or too tight to fence come back unchanged.
pub fn trim_members(members: &[f64], iqr_multiplier: f64, min_keep: usize) -> Vec<f64> {
    if members.len() < min_keep.max(1) {
        return members.to_vec();
    }
    let Some((q1, q3)) = quartiles(members) else {
        return members.to_vec();
    };
    let iqr = q3 - q1;
    if iqr <= 1e-12 {
        return members.to_vec();
    }
    let lower = q1 - iqr_multiplier * iqr;
    let upper = q3 + iqr_multiplier * iqr;
    let kept: Vec<f64> = members
        .iter()
        .copied()
        .filter(|v| *v >= lower && *v <= upper)
        .collect();
    if kept.len() < min_keep.max(1) {
        return members.to_vec();
    }
    kept
}

/// Drop point estimates outside `[Q1 - k*IQR, Q3 + k*IQR]`.
///
/// The input is returned unchanged when it has fewer than `min_keep` records,
/// when the IQR is zero, or when filtering would leave fewer than `min_keep`.
pub fn filter_outliers(
    records: Vec<WeightedRecord>,
    iqr_multiplier: f64,
    min_keep: usize,
) -> Vec<WeightedRecord> {
    if records.len() < min_keep.max(1) {
        return records;
    }
    let values: Vec<f64> = records.iter().map(|r| r.record.point_estimate()).collect();
    let Some((q1, q3)) = quartiles(&values) else {
        return records;
    };
    let iqr = q3 - q1;
    if iqr <= 1e-12 {
        return records;
    }
    let lower = q1 - iqr_multiplier * iqr;
    let upper = q3 + iqr_multiplier * iqr;

    let kept = records
        .iter()
        .filter(|r| {
            let v = r.record.point_estimate();
            v >= lower && v <= upper
        })
        .count();
    if kept < min_keep.max(1) || kept == records.len() {
        return records;
    }

    let (kept, dropped): (Vec<_>, Vec<_>) = records.into_iter().partition(|r| {
        let v = r.record.point_estimate();
        v >= lower && v <= upper
    });
    for r in &dropped {
        tracing::debug!(
            source = r.record.source_id(),
            segment = r.record.segment_id(),
            estimate = r.record.point_estimate(),
            lower,
            upper,
            "outlier forecast discarded"
        );
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recency_factor_halves_at_half_life() {
        let w = SourceWeighting::new(12.0);
        assert!((w.recency_factor(12.0) - 0.5).abs() < 1e-12);
        assert!((w.recency_factor(0.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn quartiles_interpolate() {
        let (q1, q3) = quartiles(&[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert!((q1 - 2.0).abs() < 1e-12);
        assert!((q3 - 4.0).abs() < 1e-12);
    }

    #[test]
    fn rmse_updates_reliability_relative_to_reference() {
        let mut w = SourceWeighting::new(12.0);
        w.update_rmse("good", 1.0, 4.0);
        w.update_rmse("bad", 10.0, 4.0);
        assert!((w.reliability("good") - 4.0).abs() < 1e-12);
        assert!((w.reliability("bad") - 0.25).abs() < 1e-12);
        assert!((w.reliability("unknown") - 1.0).abs() < 1e-12);
    }
}
