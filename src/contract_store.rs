use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::decision::DecisionRecord;
use crate::model::MarketContract;
use crate::persistence::{read_json, write_json_atomic};
use crate::settlement::EntryContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Watching,
    InFlight,
    Entered,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContractState {
    pub contract: MarketContract,
    pub status: ContractStatus,
    pub entry: Option<EntryContext>,
    pub last_decision: Option<DecisionRecord>,
    /// Cycle in which the contract was last decided.
    pub decided_cycle: u64,
}

/// Keyed view of every contract the engine has seen or holds.
#[derive(Debug, Default)]
pub struct ContractStore {
    contracts: BTreeMap<String, ContractState>,
    path: Option<PathBuf>,
}

impl ContractStore {
    /// Restore open entries from `path`; watched contracts are rediscovered each cycle.
    pub fn open(path: &Path) -> Result<Self> {
        let mut store = Self {
            contracts: BTreeMap::new(),
            path: Some(path.to_path_buf()),
        };
        let entries: Vec<(MarketContract, EntryContext)> = read_json(path)?.unwrap_or_default();
        for (contract, entry) in entries {
            store.contracts.insert(
                contract.contract_id.clone(),
                ContractState {
                    contract,
                    status: ContractStatus::Entered,
                    entry: Some(entry),
                    last_decision: None,
                    decided_cycle: 0,
                },
            );
        }
        Ok(store)
    }

    pub fn observe(&mut self, contract: &MarketContract) {
        self.contracts
            .entry(contract.contract_id.clone())
            .and_modify(|s| s.contract = contract.clone())
            .or_insert_with(|| ContractState {
                contract: contract.clone(),
                status: ContractStatus::Watching,
                entry: None,
                last_decision: None,
                decided_cycle: 0,
            });
    }

    pub fn get(&self, contract_id: &str) -> Option<&ContractState> {
        self.contracts.get(contract_id)
    }

    pub fn segment_of(&self, contract_id: &str) -> Option<&str> {
        self.contracts
            .get(contract_id)
            .map(|s| s.contract.segment_id.as_str())
    }

    /// Claim a contract for this cycle. `false` if it is already in flight or
    /// was decided earlier in the same cycle.
    pub fn begin(&mut self, contract_id: &str, cycle: u64) -> bool {
        let Some(state) = self.contracts.get_mut(contract_id) else {
            return false;
        };
        if state.status == ContractStatus::InFlight || state.decided_cycle == cycle {
            return false;
        }
        state.decided_cycle = cycle;
        if state.status == ContractStatus::Watching {
            state.status = ContractStatus::InFlight;
        }
        true
    }

    pub fn finish(&mut self, contract_id: &str, decision: DecisionRecord) {
        if let Some(state) = self.contracts.get_mut(contract_id) {
            if state.status == ContractStatus::InFlight {
                state.status = ContractStatus::Watching;
            }
            state.last_decision = Some(decision);
        }
    }

    /// Record a submitted order. Repeat entries on the same side are merged at
    /// the volume-weighted price.
    pub fn record_entry(&mut self, entry: EntryContext) -> Result<()> {
        let Some(state) = self.contracts.get_mut(&entry.contract_id) else {
            return Ok(());
        };
        let merged = match state.entry.take() {
            Some(prev) if prev.side == entry.side => {
                let total = prev.contracts + entry.contracts;
                let price = (prev.entry_price_cents as f64 * prev.contracts as f64
                    + entry.entry_price_cents as f64 * entry.contracts as f64)
                    / total.max(1) as f64;
                EntryContext {
                    contracts: total,
                    entry_price_cents: price.round() as u32,
                    entered_at: prev.entered_at.or(entry.entered_at),
                    ..entry
                }
            }
            _ => entry,
        };
        state.entry = Some(merged);
        state.status = ContractStatus::Entered;
        self.persist()
    }

    pub fn entries(&self) -> Vec<&EntryContext> {
        self.contracts
            .values()
            .filter_map(|s| s.entry.as_ref())
            .collect()
    }

    /// Drop watched contracts that settled at or before `now`. Held entries
    /// stay until their settlement is applied.
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.contracts.len();
        self.contracts.retain(|_, s| {
            s.entry.is_some()
                || s.status == ContractStatus::InFlight
                || s.contract.settles_at > now
        });
        before - self.contracts.len()
    }

    /// Shrink an open entry after `sold` contracts were sold. Selling all of
    /// it leaves the contract watched with no entry.
    pub fn reduce_entry(&mut self, contract_id: &str, sold: u32) -> Result<()> {
        let Some(state) = self.contracts.get_mut(contract_id) else {
            return Ok(());
        };
        let Some(entry) = state.entry.as_mut() else {
            return Ok(());
        };
        if sold >= entry.contracts {
            state.entry = None;
            state.status = ContractStatus::Watching;
        } else {
            entry.contracts -= sold;
        }
        self.persist()
    }

    /// Record a decision taken outside `begin`/`finish` and claim the
    /// contract for `cycle`.
    pub fn mark_decided(&mut self, contract_id: &str, cycle: u64, decision: DecisionRecord) {
        if let Some(state) = self.contracts.get_mut(contract_id) {
            state.decided_cycle = cycle;
            state.last_decision = Some(decision);
        }
    }

    pub fn remove(&mut self, contract_id: &str) -> Result<()> {
        if self.contracts.remove(contract_id).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let entries: Vec<(&MarketContract, &EntryContext)> = self
            .contracts
            .values()
            .filter_map(|s| s.entry.as_ref().map(|e| (&s.contract, e)))
            .collect();
        write_json_atomic(path, &entries)
    }
}
