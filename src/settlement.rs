use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fusion::bias::period_bucket;
use crate::model::{OutcomeRecord, Side};
use crate::persistence::OutcomeLog;
use crate::risk::RiskGovernor;
use crate::state::LearningState;

/// What the engine knew when it entered a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryContext {
    pub contract_id: String,
    pub segment_id: String,
    pub side: Side,
    pub entry_price_cents: u32,
    pub contracts: u32,
    /// Probability of `side` paying out at entry.
    pub model_probability: f64,
    pub fused_mean: f64,
    /// Raw (uncorrected) point estimate per source at entry.
    pub source_estimates: Vec<(String, f64)>,
    pub target_time: DateTime<Utc>,
    /// When the first fill landed; absent in state written before it was tracked.
    #[serde(default)]
    pub entered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub entry: EntryContext,
    pub settled_yes: bool,
    /// Observed value of the underlying, when known.
    pub actual_value: Option<f64>,
    pub settled_at: DateTime<Utc>,
}

impl SettlementEvent {
    pub fn settlement_value_cents(&self) -> u32 {
        let paid = match self.entry.side {
            Side::Yes => self.settled_yes,
            Side::No => !self.settled_yes,
        };
        if paid {
            100
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    Applied(OutcomeRecord),
    /// Already in the outcome log; nothing changed.
    Duplicate,
}

/// Appends settlements to the outcome log and, for new rows only, feeds them
/// into every learned table.
pub struct SettlementProcessor {
    log: OutcomeLog,
    fee_rate: f64,
    max_source_rmse: f64,
}

impl SettlementProcessor {
    pub fn new(log: OutcomeLog, fee_rate: f64, max_source_rmse: f64) -> Self {
        Self {
            log,
            fee_rate,
            max_source_rmse,
        }
    }

    pub fn log(&self) -> &OutcomeLog {
        &self.log
    }

    pub fn apply(
        &self,
        event: &SettlementEvent,
        state: &mut LearningState,
        governor: &RiskGovernor,
    ) -> Result<SettlementOutcome> {
        let entry = &event.entry;
        let record = OutcomeRecord::new(
            &entry.contract_id,
            &entry.segment_id,
            entry.side,
            entry.entry_price_cents,
            entry.contracts,
            event.settlement_value_cents(),
            self.fee_rate,
            entry.model_probability,
            event.settled_at,
        );
        let observed = event.actual_value.filter(|v| v.is_finite());
        self.apply_record(record, entry, observed, state, governor)
    }

    /// Book `sold` contracts of `entry` sold at `exit_price_cents` before
    /// settlement. Realized P&L reaches segment and risk state; with no observed
    /// value the bias and spread tables are left alone.
    pub fn apply_exit(
        &self,
        entry: &EntryContext,
        sold: u32,
        exit_price_cents: u32,
        closed_at: DateTime<Utc>,
        state: &mut LearningState,
        governor: &RiskGovernor,
    ) -> Result<SettlementOutcome> {
        let record = OutcomeRecord::closed(
            &entry.contract_id,
            &entry.segment_id,
            entry.side,
            entry.entry_price_cents,
            sold,
            exit_price_cents,
            self.fee_rate,
            entry.model_probability,
            closed_at,
        );
        self.apply_record(record, entry, None, state, governor)
    }

    fn apply_record(
        &self,
        record: OutcomeRecord,
        entry: &EntryContext,
        observed: Option<f64>,
        state: &mut LearningState,
        governor: &RiskGovernor,
    ) -> Result<SettlementOutcome> {
        // The log is the idempotency gate; a replay stops here.
        if !self.log.append(&record)? {
            tracing::info!(
                contract = %entry.contract_id,
                record_id = %record.record_id,
                "settlement already applied"
            );
            return Ok(SettlementOutcome::Duplicate);
        }

        // The log row exists from here on; update every table in memory
        // before writing any of them, and keep writing past a failure.
        let mut failures: Vec<String> = Vec::new();
        if let Some(actual) = observed {
            let bucket = period_bucket(entry.target_time);
            for (source_id, predicted) in &entry.source_estimates {
                let correction =
                    state
                        .bias
                        .record_settled_error(&record, source_id, bucket, *predicted, actual);
                if let Some(rmse) = state.bias.source_rmse(source_id) {
                    state
                        .weighting
                        .update_rmse(source_id, rmse, self.max_source_rmse);
                }
                tracing::debug!(
                    source = %source_id,
                    segment = %entry.segment_id,
                    error = predicted - actual,
                    correction,
                    "bias updated"
                );
            }
            state
                .spread_floors
                .record_settled_error(&record, bucket, entry.fused_mean, actual);
        }

        if let Err(e) =
            state
                .segments
                .record_outcome(&entry.segment_id, record.won(), record.pnl, record.settled_at)
        {
            failures.push(format!("segments: {e:#}"));
        }
        if let Err(e) = state
            .risk
            .record_settlement(record.pnl, governor, record.settled_at)
        {
            failures.push(format!("risk: {e:#}"));
        }
        if observed.is_some() {
            if let Err(e) = state.bias.persist() {
                failures.push(format!("bias: {e:#}"));
            }
            if let Err(e) = state.spread_floors.persist() {
                failures.push(format!("spread floors: {e:#}"));
            }
        }

        if !failures.is_empty() {
            for failure in &failures {
                tracing::error!(
                    contract = %entry.contract_id,
                    record_id = %record.record_id,
                    error = %failure,
                    "settlement applied in memory but not persisted"
                );
            }
            return Err(anyhow!(
                "settlement {} applied but {} table(s) failed to persist: {}",
                record.record_id,
                failures.len(),
                failures.join("; ")
            ));
        }

        tracing::info!(
            contract = %entry.contract_id,
            segment = %entry.segment_id,
            side = %entry.side,
            won = record.won(),
            pnl = record.pnl,
            closed_early = !record.is_settled(),
            "settlement applied"
        );
        Ok(SettlementOutcome::Applied(record))
    }
}
