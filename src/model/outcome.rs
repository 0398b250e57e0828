use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::order::Side;

/// Immutable settlement row. Written once to the outcome log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub record_id: String,
    pub contract_id: String,
    pub segment_id: String,
    pub side: Side,
    pub entry_price_cents: u32,
    pub contracts: u32,
    /// 100 when the held side paid out, 0 when it did not. A position sold
    /// before settlement carries its exit price, strictly between the two.
    pub settlement_value_cents: u32,
    pub pnl: f64,
    pub model_probability_at_entry: f64,
    pub settled_at: DateTime<Utc>,
}

impl OutcomeRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        contract_id: &str,
        segment_id: &str,
        side: Side,
        entry_price_cents: u32,
        contracts: u32,
        settlement_value_cents: u32,
        fee_rate: f64,
        model_probability_at_entry: f64,
        settled_at: DateTime<Utc>,
    ) -> Self {
        let won = settlement_value_cents > 0;
        let stake = contracts as f64 * entry_price_cents as f64 / 100.0;
        let pnl = if won {
            let payout = contracts as f64 * settlement_value_cents as f64 / 100.0;
            payout - stake - payout * fee_rate
        } else {
            -stake
        };
        Self {
            record_id: outcome_record_id(contract_id, side, entry_price_cents, contracts),
            contract_id: contract_id.to_string(),
            segment_id: segment_id.to_string(),
            side,
            entry_price_cents,
            contracts,
            settlement_value_cents,
            pnl,
            model_probability_at_entry,
            settled_at,
        }
    }

    /// Row for `contracts` sold at `exit_price_cents` before settlement.
    #[allow(clippy::too_many_arguments)]
    pub fn closed(
        contract_id: &str,
        segment_id: &str,
        side: Side,
        entry_price_cents: u32,
        contracts: u32,
        exit_price_cents: u32,
        fee_rate: f64,
        model_probability_at_entry: f64,
        closed_at: DateTime<Utc>,
    ) -> Self {
        let exit = exit_price_cents.clamp(1, 99);
        let stake = contracts as f64 * entry_price_cents as f64 / 100.0;
        let proceeds = contracts as f64 * exit as f64 / 100.0;
        let mut hasher = Sha256::new();
        hasher.update(outcome_record_id(contract_id, side, entry_price_cents, contracts));
        hasher.update(b"exit");
        hasher.update(exit.to_be_bytes());
        hasher.update(closed_at.timestamp_millis().to_be_bytes());
        Self {
            record_id: hex::encode(hasher.finalize()),
            contract_id: contract_id.to_string(),
            segment_id: segment_id.to_string(),
            side,
            entry_price_cents,
            contracts,
            settlement_value_cents: exit,
            pnl: proceeds - stake - proceeds * fee_rate,
            model_probability_at_entry,
            settled_at: closed_at,
        }
    }

    /// `false` for positions sold before the contract resolved.
    pub fn is_settled(&self) -> bool {
        matches!(self.settlement_value_cents, 0 | 100)
    }

    /// Settled rows win when the held side paid out; early exits win when
    /// they closed at a profit.
    pub fn won(&self) -> bool {
        if self.is_settled() {
            self.settlement_value_cents == 100
        } else {
            self.pnl > 0.0
        }
    }
}

/// Stable id over the fields that identify one settled holding. Replays of the
/// same settlement hash to the same id.
pub fn outcome_record_id(
    contract_id: &str,
    side: Side,
    entry_price_cents: u32,
    contracts: u32,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contract_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(side.as_str().as_bytes());
    hasher.update(entry_price_cents.to_be_bytes());
    hasher.update(contracts.to_be_bytes());
    hex::encode(hasher.finalize())
}
