use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RiskConfig;
use crate::decision::ReasonCode;
use crate::model::{market_key, Exposure, ExposureBook, Side};
use crate::persistence::{read_json, write_json_atomic};

/// Account-wide risk counters. `day` is the UTC date the daily counters belong to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub day: NaiveDate,
    pub daily_realized_pnl: f64,
    /// Losing settlements in a row; survives the daily roll-over.
    pub consecutive_losses: u32,
    /// Losses in the current UTC day, for the session pause.
    pub session_losses: u32,
    pub drawdown_multiplier: f64,
    pub last_loss_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub per_market_exposure: BTreeMap<String, Exposure>,
}

impl RiskState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            day: now.date_naive(),
            daily_realized_pnl: 0.0,
            consecutive_losses: 0,
            session_losses: 0,
            drawdown_multiplier: 1.0,
            last_loss_at: None,
            per_market_exposure: BTreeMap::new(),
        }
    }
}

/// A proposed order, before final sizing.
#[derive(Debug, Clone)]
pub struct RiskRequest<'a> {
    pub contract_id: &'a str,
    pub side: Side,
    /// Expected average cost per contract.
    pub price_cents: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskDecision {
    /// `true` if the request may proceed.
    pub approved: bool,
    /// Upper bound on contracts for this request given per-market headroom.
    pub max_contracts: u32,
    /// Dollar headroom left in the market.
    pub max_dollars: f64,
    /// Drawdown multiplier to apply to the proposed size.
    pub size_multiplier: f64,
    /// Machine-readable reason code when rejected.
    pub reason_code: Option<ReasonCode>,
    /// Human-readable rejection reason.
    pub reason: Option<String>,
}

impl RiskDecision {
    fn reject(code: ReasonCode, reason: String) -> Self {
        Self {
            approved: false,
            max_contracts: 0,
            max_dollars: 0.0,
            size_multiplier: 0.0,
            reason_code: Some(code),
            reason: Some(reason),
        }
    }
}

/// Stateless checks over a `RiskState` snapshot.
pub struct RiskGovernor {
    cfg: RiskConfig,
    loss_cooldown: chrono::Duration,
}

impl RiskGovernor {
    pub fn new(cfg: RiskConfig) -> Result<Self> {
        let loss_cooldown = chrono::Duration::milliseconds(cfg.loss_cooldown_ms()? as i64);
        Ok(Self { cfg, loss_cooldown })
    }

    /// Size multiplier for a losing streak; the deepest level reached wins.
    pub fn drawdown_multiplier(&self, consecutive_losses: u32) -> f64 {
        self.cfg
            .drawdown_levels
            .iter()
            .filter(|level| consecutive_losses >= level.losses)
            .map(|level| level.multiplier)
            .last()
            .unwrap_or(1.0)
    }

    /// Multiplier on the standard-mode edge minimum.
    pub fn edge_multiplier(&self, state: &RiskState) -> f64 {
        if state.consecutive_losses >= self.cfg.drawdown_edge_after_losses {
            self.cfg.drawdown_edge_multiplier
        } else {
            1.0
        }
    }

    /// Account-level gates that do not depend on the contract.
    pub fn pre_check(&self, state: &RiskState, now: DateTime<Utc>) -> Option<RiskDecision> {
        // A state from a previous day no longer binds the daily counters.
        let same_day = state.day == now.date_naive();
        if same_day && state.daily_realized_pnl <= -self.cfg.max_daily_loss {
            return Some(RiskDecision::reject(
                ReasonCode::RiskDailyLossFloor,
                format!(
                    "daily realized P&L ${:.2} at or below -${:.2}",
                    state.daily_realized_pnl, self.cfg.max_daily_loss
                ),
            ));
        }
        if same_day
            && self.cfg.session_pause_losses > 0
            && state.session_losses >= self.cfg.session_pause_losses
        {
            return Some(RiskDecision::reject(
                ReasonCode::RiskLossCooldown,
                format!("session paused after {} losses today", state.session_losses),
            ));
        }
        if let Some(last) = state.last_loss_at {
            let resume_at = last + self.loss_cooldown;
            if now < resume_at {
                return Some(RiskDecision::reject(
                    ReasonCode::RiskLossCooldown,
                    format!(
                        "loss cooldown until {}",
                        resume_at.format("%Y-%m-%d %H:%M UTC")
                    ),
                ));
            }
        }
        if state.drawdown_multiplier <= 0.0 {
            return Some(RiskDecision::reject(
                ReasonCode::RiskDrawdownPaused,
                format!(
                    "trading paused after {} consecutive losses",
                    state.consecutive_losses
                ),
            ));
        }
        None
    }

    /// Full check for one request against account state and live exposure.
    pub fn evaluate(
        &self,
        request: &RiskRequest<'_>,
        state: &RiskState,
        exposure: &ExposureBook,
        now: DateTime<Utc>,
    ) -> RiskDecision {
        if let Some(rejected) = self.pre_check(state, now) {
            return rejected;
        }

        if exposure.holds_side(request.contract_id, request.side.opposite()) {
            return RiskDecision::reject(
                ReasonCode::RiskContradictoryExposure,
                format!(
                    "already exposed to {} on {}",
                    request.side.opposite(),
                    request.contract_id
                ),
            );
        }

        let key = market_key(request.contract_id);
        let existing = exposure.market(key);
        let contract_room = self
            .cfg
            .max_contracts_per_market
            .saturating_sub(existing.contracts);
        let dollar_room = (self.cfg.max_dollars_per_market - existing.dollars).max(0.0);
        let dollar_contracts = if request.price_cents > 0.0 {
            (dollar_room * 100.0 / request.price_cents + 1e-9).floor() as u32
        } else {
            0
        };
        let max_contracts = contract_room.min(dollar_contracts);
        if max_contracts == 0 {
            return RiskDecision::reject(
                ReasonCode::RiskMarketCapExceeded,
                format!(
                    "market {} holds {} contracts / ${:.2}",
                    key, existing.contracts, existing.dollars
                ),
            );
        }

        RiskDecision {
            approved: true,
            max_contracts,
            max_dollars: dollar_room,
            size_multiplier: state.drawdown_multiplier,
            reason_code: None,
            reason: None,
        }
    }
}

/// Owns and persists the `RiskState`.
pub struct RiskLedger {
    state: RiskState,
    path: Option<PathBuf>,
}

impl RiskLedger {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: RiskState::new(now),
            path: None,
        }
    }

    pub fn open(path: &Path, now: DateTime<Utc>) -> Result<Self> {
        let state = read_json::<RiskState>(path)?.unwrap_or_else(|| RiskState::new(now));
        let mut ledger = Self {
            state,
            path: Some(path.to_path_buf()),
        };
        ledger.roll_day(now);
        Ok(ledger)
    }

    pub fn state(&self) -> &RiskState {
        &self.state
    }

    /// Reset daily counters when the UTC date has changed.
    pub fn roll_day(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if self.state.day == today {
            return false;
        }
        tracing::info!(
            from = %self.state.day,
            to = %today,
            daily_realized_pnl = self.state.daily_realized_pnl,
            "risk day rolled over"
        );
        self.state.day = today;
        self.state.daily_realized_pnl = 0.0;
        self.state.session_losses = 0;
        true
    }

    pub fn record_settlement(
        &mut self,
        pnl: f64,
        governor: &RiskGovernor,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.roll_day(now);
        self.state.daily_realized_pnl += pnl;
        if pnl < 0.0 {
            self.state.consecutive_losses = self.state.consecutive_losses.saturating_add(1);
            self.state.session_losses = self.state.session_losses.saturating_add(1);
            self.state.last_loss_at = Some(now);
        } else {
            self.state.consecutive_losses = 0;
        }
        self.state.drawdown_multiplier =
            governor.drawdown_multiplier(self.state.consecutive_losses);
        tracing::info!(
            pnl,
            daily_realized_pnl = self.state.daily_realized_pnl,
            consecutive_losses = self.state.consecutive_losses,
            drawdown_multiplier = self.state.drawdown_multiplier,
            "risk ledger updated"
        );
        self.persist()
    }

    pub fn set_exposure(&mut self, exposure: &ExposureBook) {
        self.state.per_market_exposure = exposure
            .markets()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
    }

    pub fn persist(&self) -> Result<()> {
        match &self.path {
            Some(path) => write_json_atomic(path, &self.state),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GatewayPosition;

    fn governor() -> RiskGovernor {
        RiskGovernor::new(RiskConfig::default()).unwrap()
    }

    #[test]
    fn drawdown_levels_step_down() {
        let g = governor();
        assert_eq!(g.drawdown_multiplier(2), 1.0);
        assert_eq!(g.drawdown_multiplier(3), 0.75);
        assert_eq!(g.drawdown_multiplier(6), 0.5);
        assert_eq!(g.drawdown_multiplier(9), 0.25);
        assert_eq!(g.drawdown_multiplier(12), 0.0);
    }

    #[test]
    fn dollar_headroom_limits_contracts() {
        let g = governor();
        let now = Utc::now();
        let state = RiskState::new(now);
        let exposure = ExposureBook::from_snapshot(
            &[GatewayPosition {
                contract_id: "HIGHNY-26OCT20-T75".to_string(),
                side: Side::Yes,
                count: 4,
                cost_basis: 4.0,
            }],
            &[],
        );
        let decision = g.evaluate(
            &RiskRequest {
                contract_id: "HIGHNY-26OCT20-T80",
                side: Side::Yes,
                price_cents: 30.0,
            },
            &state,
            &exposure,
            now,
        );
        assert!(decision.approved);
        // $1 of room at 30c buys 3
        assert_eq!(decision.max_contracts, 3);
    }
}
