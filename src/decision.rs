use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::Side;

/// Stable taxonomy for "no trade" outcomes. These are decisions, not failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    EdgeNearThreshold,
    EdgeNoLiquidity,
    EdgePriceAboveCap,
    EdgeBelowMinimum,
    EdgeEvBelowFloor,
    AdaptiveSegmentDisabled,
    AdaptiveTrialExhausted,
    AdaptiveInconsistentState,
    RiskDailyLossFloor,
    RiskLossCooldown,
    RiskDrawdownPaused,
    RiskContradictoryExposure,
    RiskMarketCapExceeded,
    SizingNonPositiveKelly,
    SizingBelowMinimum,
    SizingEvCollapsedAtSize,
    PipelineContractInFlight,
    ObservationOutcomeDetermined,
    ObservationPastExtreme,
    ExitTakeProfit,
    ExitStopLoss,
    ExitEdgeGone,
    GatewayCircuitOpen,
    GatewaySubmitFailed,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EdgeNearThreshold => "edge.near_threshold",
            Self::EdgeNoLiquidity => "edge.no_liquidity",
            Self::EdgePriceAboveCap => "edge.price_above_cap",
            Self::EdgeBelowMinimum => "edge.below_minimum",
            Self::EdgeEvBelowFloor => "edge.ev_below_floor",
            Self::AdaptiveSegmentDisabled => "adaptive.segment_disabled",
            Self::AdaptiveTrialExhausted => "adaptive.trial_exhausted",
            Self::AdaptiveInconsistentState => "adaptive.inconsistent_state",
            Self::RiskDailyLossFloor => "risk.daily_loss_floor",
            Self::RiskLossCooldown => "risk.loss_cooldown",
            Self::RiskDrawdownPaused => "risk.drawdown_paused",
            Self::RiskContradictoryExposure => "risk.contradictory_exposure",
            Self::RiskMarketCapExceeded => "risk.market_cap_exceeded",
            Self::SizingNonPositiveKelly => "sizing.non_positive_kelly",
            Self::SizingBelowMinimum => "sizing.below_minimum",
            Self::SizingEvCollapsedAtSize => "sizing.ev_collapsed_at_size",
            Self::PipelineContractInFlight => "pipeline.contract_in_flight",
            Self::ObservationOutcomeDetermined => "observation.outcome_determined",
            Self::ObservationPastExtreme => "observation.past_extreme",
            Self::ExitTakeProfit => "exit.take_profit",
            Self::ExitStopLoss => "exit.stop_loss",
            Self::ExitEdgeGone => "exit.edge_gone",
            Self::GatewayCircuitOpen => "gateway.circuit_open",
            Self::GatewaySubmitFailed => "gateway.submit_failed",
        }
    }
}

impl Serialize for ReasonCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One per-contract outcome of a scan cycle, kept for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub contract_id: String,
    pub segment_id: String,
    pub side: Option<Side>,
    /// `true` if an order was submitted.
    pub approved: bool,
    pub contracts: u32,
    /// Machine-readable reason code: why nothing was submitted, or which
    /// trigger closed a position.
    pub reason_code: Option<String>,
    /// Human-readable reason.
    pub reason: Option<String>,
    pub decided_at: DateTime<Utc>,
}

impl DecisionRecord {
    pub fn approved(
        contract_id: &str,
        segment_id: &str,
        side: Side,
        contracts: u32,
        decided_at: DateTime<Utc>,
    ) -> Self {
        Self {
            contract_id: contract_id.to_string(),
            segment_id: segment_id.to_string(),
            side: Some(side),
            approved: true,
            contracts,
            reason_code: None,
            reason: None,
            decided_at,
        }
    }

    pub fn rejected(
        contract_id: &str,
        segment_id: &str,
        side: Option<Side>,
        code: ReasonCode,
        reason: impl Into<String>,
        decided_at: DateTime<Utc>,
    ) -> Self {
        Self {
            contract_id: contract_id.to_string(),
            segment_id: segment_id.to_string(),
            side,
            approved: false,
            contracts: 0,
            reason_code: Some(code.as_str().to_string()),
            reason: Some(reason.into()),
            decided_at,
        }
    }

    /// A sell of `contracts` held contracts, tagged with its exit trigger.
    pub fn exited(
        contract_id: &str,
        segment_id: &str,
        side: Side,
        contracts: u32,
        code: ReasonCode,
        reason: impl Into<String>,
        decided_at: DateTime<Utc>,
    ) -> Self {
        Self {
            contract_id: contract_id.to_string(),
            segment_id: segment_id.to_string(),
            side: Some(side),
            approved: true,
            contracts,
            reason_code: Some(code.as_str().to_string()),
            reason: Some(reason.into()),
            decided_at,
        }
    }
}
