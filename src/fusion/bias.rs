use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::config::FusionConfig;
use crate::model::OutcomeRecord;
use crate::persistence::{read_json, write_json_atomic};

/// Calendar month of the target time, 1..=12.
pub fn period_bucket(target_time: DateTime<Utc>) -> u32 {
    target_time.month()
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BiasKey {
    pub source_id: String,
    pub segment_id: String,
    pub period_bucket: u32,
}

impl BiasKey {
    pub fn new(source_id: &str, segment_id: &str, period_bucket: u32) -> Self {
        Self {
            source_id: source_id.to_string(),
            segment_id: segment_id.to_string(),
            period_bucket,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BiasEntry {
    /// Signed errors (predicted - actual), oldest first.
    pub errors: VecDeque<f64>,
    pub correction: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedBiasRow {
    source_id: String,
    segment_id: String,
    period_bucket: u32,
    correction: f64,
    errors: Vec<f64>,
}

/// Learned additive correction per (source, segment, month).
#[derive(Debug, Clone)]
pub struct BiasTable {
    entries: BTreeMap<BiasKey, BiasEntry>,
    history_len: usize,
    min_samples: usize,
    max_correction: f64,
    path: Option<PathBuf>,
}

impl BiasTable {
    pub fn new(cfg: &FusionConfig) -> Self {
        Self {
            entries: BTreeMap::new(),
            history_len: cfg.bias_history_len.max(1),
            min_samples: cfg.bias_min_samples.max(1),
            max_correction: cfg.bias_max_correction.abs(),
            path: None,
        }
    }

    /// Load from `path` when present; later mutations are written back there.
    pub fn open(path: &Path, cfg: &FusionConfig) -> Result<Self> {
        let mut table = Self::new(cfg);
        table.path = Some(path.to_path_buf());
        if let Some(rows) = read_json::<Vec<PersistedBiasRow>>(path)? {
            for row in rows {
                let mut errors: VecDeque<f64> = row.errors.into_iter().collect();
                while errors.len() > table.history_len {
                    errors.pop_front();
                }
                let key = BiasKey::new(&row.source_id, &row.segment_id, row.period_bucket);
                let mut entry = BiasEntry {
                    errors,
                    correction: 0.0,
                };
                entry.correction = table.correction_from(&entry.errors);
                table.entries.insert(key, entry);
            }
        }
        Ok(table)
    }

    pub fn correction(&self, source_id: &str, segment_id: &str, period_bucket: u32) -> f64 {
        self.entries
            .get(&BiasKey::new(source_id, segment_id, period_bucket))
            .map(|e| e.correction)
            .unwrap_or(0.0)
    }

    pub fn entry(&self, key: &BiasKey) -> Option<&BiasEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fold one settled forecast error into the table. Only callable with the
    /// outcome that produced it, so corrections never move speculatively.
    pub fn record_settled_error(
        &mut self,
        outcome: &OutcomeRecord,
        source_id: &str,
        period_bucket: u32,
        predicted: f64,
        actual: f64,
    ) -> f64 {
        if !predicted.is_finite() || !actual.is_finite() {
            return self.correction(source_id, &outcome.segment_id, period_bucket);
        }
        let key = BiasKey::new(source_id, &outcome.segment_id, period_bucket);
        let history_len = self.history_len;
        let mut errors = self
            .entries
            .remove(&key)
            .map(|e| e.errors)
            .unwrap_or_default();
        errors.push_back(predicted - actual);
        while errors.len() > history_len {
            errors.pop_front();
        }
        let correction = self.correction_from(&errors);
        self.entries.insert(key, BiasEntry { errors, correction });
        correction
    }

    /// Root-mean-square error across every bucket for a source.
    pub fn source_rmse(&self, source_id: &str) -> Option<f64> {
        let mut sum_sq = 0.0;
        let mut n = 0usize;
        for (key, entry) in &self.entries {
            if key.source_id != source_id {
                continue;
            }
            for e in &entry.errors {
                sum_sq += e * e;
                n += 1;
            }
        }
        (n > 0).then(|| (sum_sq / n as f64).sqrt())
    }

    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let rows: Vec<PersistedBiasRow> = self
            .entries
            .iter()
            .map(|(key, entry)| PersistedBiasRow {
                source_id: key.source_id.clone(),
                segment_id: key.segment_id.clone(),
                period_bucket: key.period_bucket,
                correction: entry.correction,
                errors: entry.errors.iter().copied().collect(),
            })
            .collect();
        write_json_atomic(path, &rows)
    }

    fn correction_from(&self, errors: &VecDeque<f64>) -> f64 {
        if errors.len() < self.min_samples {
            return 0.0;
        }
        let mean = errors.iter().sum::<f64>() / errors.len() as f64;
        mean.clamp(-self.max_correction, self.max_correction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Side;

    fn outcome() -> OutcomeRecord {
        OutcomeRecord::new("HIGHNY-26JUL14-T85", "NY", Side::Yes, 40, 1, 100, 0.05, 0.6, Utc::now())
    }

    #[test]
    fn correction_waits_for_minimum_samples() {
        let mut table = BiasTable::new(&FusionConfig::default());
        let o = outcome();
        for _ in 0..9 {
            table.record_settled_error(&o, "nws", 7, 82.0, 80.0);
        }
        assert_eq!(table.correction("nws", "NY", 7), 0.0);
        let c = table.record_settled_error(&o, "nws", 7, 82.0, 80.0);
        assert!((c - 2.0).abs() < 1e-12);
    }

    #[test]
    fn correction_is_capped_and_history_bounded() {
        let mut table = BiasTable::new(&FusionConfig::default());
        let o = outcome();
        for _ in 0..80 {
            table.record_settled_error(&o, "om", 7, 90.0, 80.0);
        }
        assert!((table.correction("om", "NY", 7) - 3.0).abs() < 1e-12);
        let entry = table.entry(&BiasKey::new("om", "NY", 7)).unwrap();
        assert_eq!(entry.errors.len(), 50);
        assert!((table.source_rmse("om").unwrap() - 10.0).abs() < 1e-9);
    }
}
