use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AdaptiveConfig;
use crate::decision::ReasonCode;
use crate::error::EngineError;
use crate::persistence::{read_json, write_json_atomic};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SegmentStatus {
    Enabled,
    Disabled { until: DateTime<Utc> },
    Trial,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentState {
    pub segment_id: String,
    pub status: SegmentStatus,
    pub trade_count: u32,
    pub win_count: u32,
    pub realized_pnl: f64,
    /// Settled trades since entering trial.
    pub trial_trades: u32,
    pub trial_wins: u32,
    /// Orders placed since entering trial.
    pub trial_entries: u32,
}

impl SegmentState {
    pub fn new(segment_id: &str) -> Self {
        Self {
            segment_id: segment_id.to_string(),
            status: SegmentStatus::Enabled,
            trade_count: 0,
            win_count: 0,
            realized_pnl: 0.0,
            trial_trades: 0,
            trial_wins: 0,
            trial_entries: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        !matches!(self.status, SegmentStatus::Disabled { .. })
    }

    pub fn trial_mode(&self) -> bool {
        matches!(self.status, SegmentStatus::Trial)
    }

    pub fn disabled_until(&self) -> Option<DateTime<Utc>> {
        match self.status {
            SegmentStatus::Disabled { until } => Some(until),
            _ => None,
        }
    }

    pub fn win_rate(&self) -> f64 {
        if self.trade_count == 0 {
            0.0
        } else {
            self.win_count as f64 / self.trade_count as f64
        }
    }

    pub fn trial_win_rate(&self) -> f64 {
        if self.trial_trades == 0 {
            0.0
        } else {
            self.trial_wins as f64 / self.trial_trades as f64
        }
    }
}

/// On-disk shape of one segment.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedSegment {
    enabled: bool,
    trial_mode: bool,
    trade_count: u32,
    win_count: u32,
    realized_pnl: f64,
    disabled_until: Option<DateTime<Utc>>,
    #[serde(default)]
    trial_trades: u32,
    #[serde(default)]
    trial_wins: u32,
    #[serde(default)]
    trial_entries: u32,
}

impl PersistedSegment {
    fn from_state(s: &SegmentState) -> Self {
        Self {
            enabled: s.enabled(),
            trial_mode: s.trial_mode(),
            trade_count: s.trade_count,
            win_count: s.win_count,
            realized_pnl: s.realized_pnl,
            disabled_until: s.disabled_until(),
            trial_trades: s.trial_trades,
            trial_wins: s.trial_wins,
            trial_entries: s.trial_entries,
        }
    }

    fn into_state(self, segment_id: &str) -> Result<SegmentState, EngineError> {
        let status = match (self.enabled, self.trial_mode, self.disabled_until) {
            (true, false, _) => SegmentStatus::Enabled,
            (true, true, _) => SegmentStatus::Trial,
            (false, false, Some(until)) => SegmentStatus::Disabled { until },
            (false, true, _) => {
                return Err(EngineError::inconsistent(
                    segment_id,
                    "segment is both disabled and in trial",
                ))
            }
            (false, false, None) => {
                return Err(EngineError::inconsistent(
                    segment_id,
                    "disabled segment has no disabled_until",
                ))
            }
        };
        if self.win_count > self.trade_count || self.trial_wins > self.trial_trades {
            return Err(EngineError::inconsistent(
                segment_id,
                format!("win_count {} exceeds trade_count {}", self.win_count, self.trade_count),
            ));
        }
        Ok(SegmentState {
            segment_id: segment_id.to_string(),
            status,
            trade_count: self.trade_count,
            win_count: self.win_count,
            realized_pnl: self.realized_pnl,
            trial_trades: self.trial_trades,
            trial_wins: self.trial_wins,
            trial_entries: self.trial_entries,
        })
    }
}

/// Whether a segment may trade right now, and at what size multiplier.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentGate {
    pub allowed: bool,
    pub multiplier: f64,
    pub code: Option<ReasonCode>,
    pub reason: Option<String>,
}

impl SegmentGate {
    fn open(multiplier: f64) -> Self {
        Self {
            allowed: true,
            multiplier,
            code: None,
            reason: None,
        }
    }

    fn closed(code: ReasonCode, reason: String) -> Self {
        Self {
            allowed: false,
            multiplier: 0.0,
            code: Some(code),
            reason: Some(reason),
        }
    }
}

/// Per-segment ENABLED / DISABLED(until) / TRIAL state machine.
pub struct SegmentManager {
    cfg: AdaptiveConfig,
    cooldown: chrono::Duration,
    states: BTreeMap<String, SegmentState>,
    /// Rows whose persisted state could not be trusted, kept verbatim so a
    /// rewrite of the file never drops them.
    quarantined: BTreeMap<String, Value>,
    /// The whole state file failed to parse; every segment is held disabled.
    corrupt: bool,
    path: Option<PathBuf>,
}

impl SegmentManager {
    pub fn new(cfg: AdaptiveConfig) -> Result<Self> {
        let cooldown = chrono::Duration::milliseconds(cfg.cooldown_ms()? as i64);
        Ok(Self {
            cfg,
            cooldown,
            states: BTreeMap::new(),
            quarantined: BTreeMap::new(),
            corrupt: false,
            path: None,
        })
    }

    /// Load persisted state. A file that fails to parse does not abort startup;
    /// the manager comes up with every segment disabled until it is fixed.
    pub fn open(path: &Path, cfg: AdaptiveConfig) -> Result<Self> {
        let mut manager = Self::new(cfg)?;
        manager.path = Some(path.to_path_buf());
        match read_json::<BTreeMap<String, Value>>(path) {
            Ok(Some(persisted)) => {
                for (segment_id, raw) in persisted {
                    let parsed = serde_json::from_value::<PersistedSegment>(raw.clone())
                        .map_err(|e| EngineError::inconsistent(&segment_id, e.to_string()))
                        .and_then(|row| row.into_state(&segment_id));
                    match parsed {
                        Ok(state) => {
                            manager.states.insert(segment_id, state);
                        }
                        Err(e) => {
                            tracing::error!(
                                segment = %segment_id,
                                error = %e,
                                "segment state quarantined"
                            );
                            manager.quarantined.insert(segment_id, raw);
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(
                    path = %path.display(),
                    error = %format!("{e:#}"),
                    "segment state unreadable; all segments disabled"
                );
                manager.corrupt = true;
            }
        }
        Ok(manager)
    }

    pub fn is_corrupt(&self) -> bool {
        self.corrupt
    }

    pub fn inconsistency(&self, segment_id: &str) -> Option<EngineError> {
        if self.corrupt {
            return Some(EngineError::inconsistent("segments", "state file failed to parse"));
        }
        self.quarantined
            .contains_key(segment_id)
            .then(|| EngineError::inconsistent(segment_id, "persisted segment state rejected"))
    }

    pub fn state(&self, segment_id: &str) -> SegmentState {
        self.states
            .get(segment_id)
            .cloned()
            .unwrap_or_else(|| SegmentState::new(segment_id))
    }

    pub fn snapshot(&self) -> Vec<SegmentState> {
        self.states.values().cloned().collect()
    }

    /// Fold one settled trade into the segment's counters.
    pub fn record_outcome(
        &mut self,
        segment_id: &str,
        won: bool,
        pnl: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.quarantined.contains_key(segment_id) {
            tracing::warn!(
                segment = %segment_id,
                won,
                pnl,
                "outcome not applied to quarantined segment"
            );
            return Ok(());
        }
        let state = self
            .states
            .entry(segment_id.to_string())
            .or_insert_with(|| SegmentState::new(segment_id));
        state.trade_count = state.trade_count.saturating_add(1);
        if won {
            state.win_count = state.win_count.saturating_add(1);
        }
        state.realized_pnl += pnl;
        if state.trial_mode() {
            state.trial_trades = state.trial_trades.saturating_add(1);
            if won {
                state.trial_wins = state.trial_wins.saturating_add(1);
            }
        }
        tracing::info!(
            segment = %segment_id,
            won,
            pnl,
            trade_count = state.trade_count,
            win_rate = state.win_rate(),
            at = %now,
            "segment outcome recorded"
        );
        self.persist()
    }

    /// Count an order placed while the segment is in trial.
    pub fn record_entry(&mut self, segment_id: &str) -> Result<()> {
        let Some(state) = self.states.get_mut(segment_id) else {
            return Ok(());
        };
        if !state.trial_mode() {
            return Ok(());
        }
        state.trial_entries = state.trial_entries.saturating_add(1);
        self.persist()
    }

    /// Apply any due transition and persist when the status changed.
    pub fn evaluate(&mut self, segment_id: &str, now: DateTime<Utc>) -> Result<SegmentStatus> {
        let min_trades = self.cfg.min_trades;
        let floor = self.cfg.win_rate_floor;
        let trial_size = self.cfg.trial_trades.max(1);
        let cooldown = self.cooldown;

        let state = self
            .states
            .entry(segment_id.to_string())
            .or_insert_with(|| SegmentState::new(segment_id));
        let before = state.status;
        let next = match state.status {
            SegmentStatus::Enabled => {
                if state.trade_count >= min_trades && state.win_rate() < floor {
                    SegmentStatus::Disabled {
                        until: now + cooldown,
                    }
                } else {
                    SegmentStatus::Enabled
                }
            }
            SegmentStatus::Disabled { until } => {
                if now >= until {
                    state.trial_trades = 0;
                    state.trial_wins = 0;
                    state.trial_entries = 0;
                    SegmentStatus::Trial
                } else {
                    SegmentStatus::Disabled { until }
                }
            }
            SegmentStatus::Trial => {
                if state.trial_trades >= trial_size {
                    if state.trial_win_rate() >= floor {
                        state.trade_count = state.trial_trades;
                        state.win_count = state.trial_wins;
                        SegmentStatus::Enabled
                    } else {
                        SegmentStatus::Disabled {
                            until: now + cooldown,
                        }
                    }
                } else {
                    SegmentStatus::Trial
                }
            }
        };

        if next != before {
            state.status = next;
            match next {
                SegmentStatus::Disabled { until } => tracing::warn!(
                    segment = %segment_id,
                    trade_count = state.trade_count,
                    win_rate = state.win_rate(),
                    trial_win_rate = state.trial_win_rate(),
                    until = %until,
                    "segment disabled"
                ),
                SegmentStatus::Trial => {
                    tracing::info!(segment = %segment_id, "segment entering trial")
                }
                SegmentStatus::Enabled => tracing::info!(
                    segment = %segment_id,
                    trial_win_rate = state.trial_win_rate(),
                    "segment re-enabled after trial"
                ),
            }
            self.persist()?;
        }
        Ok(next)
    }

    /// Size multiplier from realized win rate once the sample is large enough.
    pub fn position_multiplier(&self, segment_id: &str) -> f64 {
        let state = self.state(segment_id);
        if !state.enabled() {
            return 0.0;
        }
        if state.trade_count < self.cfg.min_trades {
            return 1.0;
        }
        (0.5 + state.win_rate()).clamp(0.5, 1.5)
    }

    /// Evaluate transitions, then decide whether the segment may trade.
    pub fn gate(&mut self, segment_id: &str, now: DateTime<Utc>) -> Result<SegmentGate> {
        if let Some(e) = self.inconsistency(segment_id) {
            return Ok(SegmentGate::closed(
                ReasonCode::AdaptiveInconsistentState,
                e.to_string(),
            ));
        }
        let status = self.evaluate(segment_id, now)?;
        let state = self.state(segment_id);
        let gate = match status {
            SegmentStatus::Disabled { until } => SegmentGate::closed(
                ReasonCode::AdaptiveSegmentDisabled,
                format!(
                    "disabled until {} (win rate {:.0}% over {})",
                    until.format("%Y-%m-%d %H:%M UTC"),
                    state.win_rate() * 100.0,
                    state.trade_count
                ),
            ),
            SegmentStatus::Trial if state.trial_entries >= self.cfg.trial_trades.max(1) => {
                SegmentGate::closed(
                    ReasonCode::AdaptiveTrialExhausted,
                    format!(
                        "trial allowance used ({} entries, {} settled)",
                        state.trial_entries, state.trial_trades
                    ),
                )
            }
            _ => SegmentGate::open(self.position_multiplier(segment_id)),
        };
        Ok(gate)
    }

    /// Clear a quarantined or disabled segment back to a fresh enabled state.
    pub fn reset_segment(&mut self, segment_id: &str) -> Result<()> {
        self.quarantined.remove(segment_id);
        self.states
            .insert(segment_id.to_string(), SegmentState::new(segment_id));
        tracing::info!(segment = %segment_id, "segment state reset");
        self.persist()
    }

    pub fn persist(&self) -> Result<()> {
        // Never overwrite a file we could not parse.
        if self.corrupt {
            return Ok(());
        }
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut rows = BTreeMap::new();
        for (id, state) in &self.states {
            if self.quarantined.contains_key(id) {
                continue;
            }
            let row = serde_json::to_value(PersistedSegment::from_state(state))?;
            rows.insert(id.as_str(), row);
        }
        for (id, raw) in &self.quarantined {
            rows.insert(id.as_str(), raw.clone());
        }
        write_json_atomic(path, &rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persisted_disabled_without_until_is_rejected() {
        let row = PersistedSegment {
            enabled: false,
            trial_mode: false,
            trade_count: 3,
            win_count: 1,
            realized_pnl: -1.0,
            disabled_until: None,
            trial_trades: 0,
            trial_wins: 0,
            trial_entries: 0,
        };
        assert!(matches!(
            row.into_state("NY"),
            Err(EngineError::InconsistentState { .. })
        ));
    }

    #[test]
    fn multiplier_follows_win_rate_after_minimum_sample() {
        let mut manager = SegmentManager::new(AdaptiveConfig::default()).unwrap();
        let now = Utc::now();
        for i in 0..10 {
            manager.record_outcome("MIA", i < 8, 1.0, now).unwrap();
        }
        assert!((manager.position_multiplier("MIA") - 1.3).abs() < 1e-12);
        assert!((manager.position_multiplier("LAX") - 1.0).abs() < 1e-12);
    }
}
