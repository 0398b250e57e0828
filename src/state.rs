use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::adaptive::SegmentManager;
use crate::config::Config;
use crate::fusion::{BiasTable, SourceWeighting, SpreadFloorTable};
use crate::persistence::OutcomeLog;
use crate::risk::RiskLedger;

pub const SEGMENTS_FILE: &str = "segments.json";
pub const BIAS_FILE: &str = "bias_table.json";
pub const SPREAD_FLOORS_FILE: &str = "spread_floors.json";
pub const RISK_FILE: &str = "risk_state.json";
pub const OUTCOMES_FILE: &str = "outcomes.sqlite";
pub const OPEN_ENTRIES_FILE: &str = "open_entries.json";

/// Everything the engine learns from settlements.
pub struct LearningState {
    pub weighting: SourceWeighting,
    pub bias: BiasTable,
    pub spread_floors: SpreadFloorTable,
    pub segments: SegmentManager,
    pub risk: RiskLedger,
}

impl LearningState {
    /// Fresh, unpersisted state.
    pub fn in_memory(config: &Config, now: DateTime<Utc>) -> Result<Self> {
        let mut weighting = SourceWeighting::new(config.fusion.half_life_hours);
        for source in &config.sources {
            weighting.register(&source.id, source.is_ensemble);
        }
        Ok(Self {
            weighting,
            bias: BiasTable::new(&config.fusion),
            spread_floors: SpreadFloorTable::new(&config.fusion),
            segments: SegmentManager::new(config.adaptive.clone())?,
            risk: RiskLedger::new(now),
        })
    }

    /// Load every table from the state directory. Reliability is rebuilt from
    /// the bias history rather than stored separately.
    pub fn open(config: &Config, now: DateTime<Utc>) -> Result<Self> {
        let dir = &config.persistence;
        let bias = BiasTable::open(&dir.path(BIAS_FILE), &config.fusion)?;
        let mut weighting = SourceWeighting::new(config.fusion.half_life_hours);
        for source in &config.sources {
            weighting.register(&source.id, source.is_ensemble);
            if let Some(rmse) = bias.source_rmse(&source.id) {
                weighting.update_rmse(&source.id, rmse, config.fusion.max_source_rmse);
            }
        }
        let state = Self {
            weighting,
            bias,
            spread_floors: SpreadFloorTable::open(&dir.path(SPREAD_FLOORS_FILE), &config.fusion)?,
            segments: SegmentManager::open(&dir.path(SEGMENTS_FILE), config.adaptive.clone())?,
            risk: RiskLedger::open(&dir.path(RISK_FILE), now)?,
        };
        tracing::info!(
            state_dir = %dir.state_dir,
            bias_entries = state.bias.len(),
            segments = state.segments.snapshot().len(),
            segments_corrupt = state.segments.is_corrupt(),
            "learning state loaded"
        );
        Ok(state)
    }
}

pub fn open_outcome_log(config: &Config) -> Result<OutcomeLog> {
    Ok(OutcomeLog::open(&config.persistence.path(OUTCOMES_FILE))?)
}
