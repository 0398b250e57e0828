use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::FusionConfig;
use crate::model::OutcomeRecord;
use crate::persistence::{read_json, write_json_atomic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Season {
    Winter,
    Spring,
    Summer,
    Fall,
}

impl Season {
    pub fn from_month(month: u32) -> Self {
        match month {
            3..=5 => Season::Spring,
            6..=8 => Season::Summer,
            9..=11 => Season::Fall,
            _ => Season::Winter,
        }
    }
}

/// Per-segment, per-season uncertainty floor learned from how far the fused
/// mean landed from the settled value.
#[derive(Debug, Clone)]
pub struct SpreadFloorTable {
    errors: BTreeMap<String, BTreeMap<Season, VecDeque<f64>>>,
    history_len: usize,
    min_samples: usize,
    minimum: f64,
    path: Option<PathBuf>,
}

impl SpreadFloorTable {
    pub fn new(cfg: &FusionConfig) -> Self {
        Self {
            errors: BTreeMap::new(),
            history_len: cfg.spread_floor_history_len.max(1),
            min_samples: cfg.spread_floor_min_samples.max(2),
            minimum: cfg.spread_floor_minimum.max(0.0),
            path: None,
        }
    }

    pub fn open(path: &Path, cfg: &FusionConfig) -> Result<Self> {
        let mut table = Self::new(cfg);
        table.path = Some(path.to_path_buf());
        if let Some(errors) = read_json(path)? {
            table.errors = errors;
        }
        Ok(table)
    }

    pub fn record_settled_error(
        &mut self,
        outcome: &OutcomeRecord,
        month: u32,
        fused_mean: f64,
        actual: f64,
    ) {
        if !fused_mean.is_finite() || !actual.is_finite() {
            return;
        }
        let history = self
            .errors
            .entry(outcome.segment_id.clone())
            .or_default()
            .entry(Season::from_month(month))
            .or_default();
        history.push_back(fused_mean - actual);
        while history.len() > self.history_len {
            history.pop_front();
        }
    }

    /// Population std of settled errors once enough exist, else `fallback`.
    pub fn floor(&self, segment_id: &str, month: u32, fallback: f64) -> f64 {
        let Some(history) = self
            .errors
            .get(segment_id)
            .and_then(|by_season| by_season.get(&Season::from_month(month)))
        else {
            return fallback;
        };
        if history.len() < self.min_samples {
            return fallback;
        }
        let n = history.len() as f64;
        let mean = history.iter().sum::<f64>() / n;
        let var = history.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / n;
        var.sqrt().max(self.minimum)
    }

    pub fn persist(&self) -> Result<()> {
        match &self.path {
            Some(path) => write_json_atomic(path, &self.errors),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Side;
    use chrono::Utc;

    #[test]
    fn floor_uses_fallback_until_enough_samples() {
        let mut table = SpreadFloorTable::new(&FusionConfig::default());
        let o = OutcomeRecord::new("X-1", "DEN", Side::No, 60, 1, 0, 0.05, 0.4, Utc::now());
        for i in 0..19 {
            table.record_settled_error(&o, 1, 40.0 + (i % 2) as f64 * 4.0, 40.0);
        }
        assert!((table.floor("DEN", 1, 5.0) - 5.0).abs() < 1e-12);
        table.record_settled_error(&o, 12, 44.0, 40.0);
        // 20 samples alternating 0 and 4: std 2.0
        assert!((table.floor("DEN", 2, 5.0) - 2.0).abs() < 1e-9);
        assert!((table.floor("DEN", 7, 5.0) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn floor_never_drops_below_minimum() {
        let mut table = SpreadFloorTable::new(&FusionConfig::default());
        let o = OutcomeRecord::new("X-1", "MIA", Side::Yes, 60, 1, 100, 0.05, 0.7, Utc::now());
        for _ in 0..30 {
            table.record_settled_error(&o, 7, 90.0, 90.0);
        }
        assert!((table.floor("MIA", 7, 3.0) - 1.5).abs() < 1e-12);
    }
}
