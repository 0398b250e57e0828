use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;

use crate::adaptive::SegmentState;
use crate::calibration::{calibration_report, CalibrationReport};
use crate::config::Config;
use crate::contract_store::ContractStore;
use crate::decision::{DecisionRecord, ReasonCode};
use crate::edge::{EdgeEvaluator, EdgeInput, EdgeOutcome, TradeCandidate};
use crate::error::{EngineError, EngineResult};
use crate::fusion::{filter_outliers, BootstrapEstimator, DistributionBuilder, FusedEstimate};
use crate::gateway::circuit_breaker::BreakerStats;
use crate::gateway::{with_retry, MarketGateway, RetryPolicy, SubmitBreaker};
use crate::model::{
    market_key, ExposureBook, ForecastRecord, MarketContract, OrderBook, OrderRequest,
    SourceProfile,
};
use crate::observation::{ObservationGate, ObservationSource, SameDay};
use crate::risk::{RiskGovernor, RiskRequest, RiskState};
use crate::settlement::{EntryContext, SettlementEvent, SettlementOutcome, SettlementProcessor};
use crate::signal::{fetch_records, ForecastSource};
use crate::sizing::{HeldPosition, PositionSizer, SizingInput};
use crate::state::LearningState;

/// Read-only view published after every cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineSnapshot {
    pub cycle: u64,
    pub updated_at: Option<DateTime<Utc>>,
    pub segments: Vec<SegmentState>,
    pub segments_corrupt: bool,
    pub risk: Option<RiskState>,
    pub breaker: Option<BreakerStats>,
    pub sources: Vec<SourceProfile>,
    pub calibration: CalibrationReport,
    pub decisions: Vec<DecisionRecord>,
    pub open_entries: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub segments_scanned: usize,
    pub segments_skipped: usize,
    pub contracts_evaluated: usize,
    pub orders_submitted: usize,
    pub settlements_applied: usize,
    pub exits_executed: usize,
    pub contracts_pruned: usize,
    pub decisions: Vec<DecisionRecord>,
}

pub struct ScanEngine {
    config: Config,
    sources: Vec<Arc<dyn ForecastSource>>,
    gateway: Arc<dyn MarketGateway>,
    state: LearningState,
    settlement: SettlementProcessor,
    governor: RiskGovernor,
    builder: DistributionBuilder,
    bootstrap: BootstrapEstimator,
    evaluator: EdgeEvaluator,
    sizer: PositionSizer,
    store: ContractStore,
    breaker: SubmitBreaker,
    retry: RetryPolicy,
    observations: Option<Arc<dyn ObservationSource>>,
    observation_gate: ObservationGate,
    min_hold: chrono::Duration,
    /// Fused estimates by (segment, target date), cleared every cycle.
    fused_cache: BTreeMap<(String, NaiveDate), FusedEstimate>,
    calibration: CalibrationReport,
    calibrated_rows: u64,
    cycle: u64,
    snapshot_tx: watch::Sender<EngineSnapshot>,
}

impl ScanEngine {
    pub fn new(
        config: Config,
        sources: Vec<Arc<dyn ForecastSource>>,
        gateway: Arc<dyn MarketGateway>,
        mut state: LearningState,
        settlement: SettlementProcessor,
        store: ContractStore,
    ) -> Result<Self> {
        for source in &sources {
            state
                .weighting
                .register(source.source_id(), source.is_ensemble());
        }
        let governor = RiskGovernor::new(config.risk.clone())?;
        let min_hold = chrono::Duration::milliseconds(config.exit.min_hold_ms()? as i64);
        let (snapshot_tx, _) = watch::channel(EngineSnapshot::default());
        Ok(Self {
            builder: DistributionBuilder::new(config.fusion.clone()),
            bootstrap: BootstrapEstimator::new(
                config.fusion.bootstrap_samples,
                config.fusion.bootstrap_seed,
            ),
            evaluator: EdgeEvaluator::new(config.edge.clone(), config.sizing.depth_penalty_cents),
            sizer: PositionSizer::new(
                config.sizing.clone(),
                config.edge.fee_rate,
                config.edge.max_buy_price_cents,
            ),
            breaker: SubmitBreaker::new(config.gateway.circuit_breaker_failures),
            retry: RetryPolicy::from_config(&config.gateway),
            observations: None,
            observation_gate: ObservationGate::new(config.observations.clone()),
            min_hold,
            fused_cache: BTreeMap::new(),
            calibration: CalibrationReport::default(),
            calibrated_rows: 0,
            governor,
            config,
            sources,
            gateway,
            state,
            settlement,
            store,
            cycle: 0,
            snapshot_tx,
        })
    }

    /// Feed for same-day observed extremes. Without one only the local
    /// cutoff hours gate same-day contracts.
    pub fn with_observations(mut self, source: Arc<dyn ObservationSource>) -> Self {
        self.observations = Some(source);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn state(&self) -> &LearningState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut LearningState {
        &mut self.state
    }

    pub fn store(&self) -> &ContractStore {
        &self.store
    }

    pub fn breaker(&self) -> &SubmitBreaker {
        &self.breaker
    }

    pub fn settlement(&self) -> &SettlementProcessor {
        &self.settlement
    }

    /// One full scan: settle, exit, fetch, fuse, evaluate, size, gate, submit.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleReport> {
        self.cycle += 1;
        self.breaker.reset();
        self.state.risk.roll_day(now);
        self.fused_cache.clear();
        let mut report = CycleReport {
            cycle: self.cycle,
            ..CycleReport::default()
        };

        report.contracts_pruned = self.store.prune_expired(now);
        if report.contracts_pruned > 0 {
            tracing::debug!(pruned = report.contracts_pruned, "expired contracts dropped");
        }
        report.settlements_applied = self.settle_resolved(now).await;
        self.manage_exits(now, &mut report).await;

        let segment_ids: Vec<String> = self.config.segments.iter().map(|s| s.id.clone()).collect();
        for segment_id in &segment_ids {
            match self.scan_segment(segment_id, now, &mut report).await {
                Ok(()) => report.segments_scanned += 1,
                Err(e) if e.is_expected_skip() => {
                    report.segments_skipped += 1;
                    tracing::debug!(segment = %segment_id, reason = %e, "segment skipped");
                }
                Err(e) => {
                    report.segments_skipped += 1;
                    tracing::warn!(segment = %segment_id, error = %e, "segment scan failed");
                }
            }
        }

        if let Err(e) = self.state.risk.persist() {
            tracing::error!(error = %format!("{e:#}"), "failed to persist risk state");
        }
        self.refresh_calibration();
        self.publish(now, &report.decisions);
        tracing::info!(
            cycle = report.cycle,
            segments_scanned = report.segments_scanned,
            segments_skipped = report.segments_skipped,
            contracts_evaluated = report.contracts_evaluated,
            orders_submitted = report.orders_submitted,
            settlements_applied = report.settlements_applied,
            exits_executed = report.exits_executed,
            "scan cycle complete"
        );
        Ok(report)
    }

    /// Apply a settlement produced outside the gateway poll (replays, manual input).
    pub fn apply_settlement(&mut self, event: &SettlementEvent) -> Result<SettlementOutcome> {
        let outcome = self
            .settlement
            .apply(event, &mut self.state, &self.governor)?;
        self.store.remove(&event.entry.contract_id)?;
        Ok(outcome)
    }

    async fn settle_resolved(&mut self, now: DateTime<Utc>) -> usize {
        let open: Vec<String> = self
            .store
            .entries()
            .into_iter()
            .map(|e| e.contract_id.clone())
            .collect();
        if open.is_empty() {
            return 0;
        }
        let gateway = self.gateway.clone();
        let settled = match with_retry(&self.retry, "get_settlements", || {
            gateway.get_settlements(&open)
        })
        .await
        {
            Ok(settled) => settled,
            Err(e) => {
                tracing::warn!(error = %e, "settlement poll failed");
                return 0;
            }
        };

        let mut applied = 0;
        for s in settled {
            let Some(entry) = self
                .store
                .get(&s.contract_id)
                .and_then(|c| c.entry.clone())
            else {
                continue;
            };
            let event = SettlementEvent {
                entry,
                settled_yes: s.settled_yes,
                actual_value: s.actual_value,
                settled_at: s.settled_at.min(now),
            };
            match self.apply_settlement(&event) {
                Ok(SettlementOutcome::Applied(_)) => applied += 1,
                Ok(SettlementOutcome::Duplicate) => {}
                Err(e) => tracing::error!(
                    contract = %s.contract_id,
                    error = %format!("{e:#}"),
                    "settlement failed"
                ),
            }
        }
        applied
    }

    async fn scan_segment(
        &mut self,
        segment_id: &str,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> EngineResult<()> {
        let gateway = self.gateway.clone();
        let horizon = chrono::Duration::days(self.config.engine.horizon_days as i64);
        let markets = with_retry(&self.retry, "list_markets", || gateway.list_markets(segment_id))
            .await?;
        let mut by_date: BTreeMap<NaiveDate, Vec<MarketContract>> = BTreeMap::new();
        for contract in markets
            .into_iter()
            .filter(|c| c.settles_at > now && c.settles_at <= now + horizon)
        {
            self.store.observe(&contract);
            by_date.entry(contract.target_date()).or_default().push(contract);
        }
        if by_date.is_empty() {
            return Err(EngineError::data_unavailable(segment_id, "no open markets in horizon"));
        }

        for (date, contracts) in by_date {
            let target_time = contracts[0].settles_at;
            let fused = match self.fused_for(segment_id, target_time, now).await {
                Ok(fused) => fused,
                Err(e) if e.is_expected_skip() => {
                    tracing::debug!(
                        segment = %segment_id,
                        date = %date,
                        reason = %e,
                        "date skipped"
                    );
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        segment = %segment_id,
                        date = %date,
                        error = %e,
                        "fusion failed"
                    );
                    continue;
                }
            };
            tracing::info!(
                segment = %segment_id,
                date = %date,
                mean = fused.distribution.mean(),
                spread = fused.distribution.spread(),
                sources = fused.source_count(),
                "distribution built"
            );
            let same_day = self.same_day(segment_id, &contracts[0], now).await;
            for contract in &contracts {
                report.contracts_evaluated += 1;
                let decision = self.decide(contract, &fused, same_day.as_ref(), now).await;
                if decision.approved {
                    report.orders_submitted += 1;
                }
                self.store.finish(&contract.contract_id, decision.clone());
                report.decisions.push(decision);
            }
        }
        Ok(())
    }

    async fn fetch_all(
        &self,
        segment_id: &str,
        target_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<ForecastRecord> {
        let timeout = Duration::from_millis(self.config.engine.fetch_timeout_ms.max(1));
        let mut results: Vec<(String, EngineResult<Vec<ForecastRecord>>)> =
            stream::iter(self.sources.iter().cloned())
                .map(|source| async move {
                    let id = source.source_id().to_string();
                    let fetched = tokio::time::timeout(
                        timeout,
                        fetch_records(source.as_ref(), segment_id, target_time, now),
                    )
                    .await;
                    let result = match fetched {
                        Ok(result) => result,
                        Err(_) => Err(EngineError::external(
                            &id,
                            format!("fetch timed out after {}ms", timeout.as_millis()),
                        )),
                    };
                    (id, result)
                })
                .buffer_unordered(self.config.engine.max_parallel_fetches.max(1))
                .collect()
                .await;
        results.sort_by(|a, b| a.0.cmp(&b.0));

        let mut records = Vec::new();
        for (source_id, result) in results {
            match result {
                Ok(mut batch) => records.append(&mut batch),
                Err(e) if e.is_expected_skip() => {
                    tracing::debug!(
                        source = %source_id,
                        segment = %segment_id,
                        reason = %e,
                        "source had no data"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        source = %source_id,
                        segment = %segment_id,
                        error = %e,
                        "source fetch failed"
                    );
                }
            }
        }
        records
    }

    async fn fuse(
        &mut self,
        segment_id: &str,
        target_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> EngineResult<FusedEstimate> {
        let records = self.fetch_all(segment_id, target_time, now).await;
        if records.is_empty() {
            return Err(EngineError::data_unavailable(segment_id, "no source returned records"));
        }
        self.state.weighting.observe(&records);
        let weighted = filter_outliers(
            self.state.weighting.weigh(records, now),
            self.config.fusion.outlier_iqr_multiplier,
            self.config.fusion.min_records_for_outlier_filter,
        );
        let floor = self.state.spread_floors.floor(
            segment_id,
            target_time.month(),
            self.config.fallback_spread_for(segment_id),
        );
        let hours = (target_time - now).num_seconds() as f64 / 3600.0;
        self.builder
            .build(segment_id, &weighted, &self.state.bias, floor, hours)
    }

    async fn fused_for(
        &mut self,
        segment_id: &str,
        target_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> EngineResult<FusedEstimate> {
        let key = (segment_id.to_string(), target_time.date_naive());
        if let Some(fused) = self.fused_cache.get(&key) {
            return Ok(fused.clone());
        }
        let fused = self.fuse(segment_id, target_time, now).await?;
        self.fused_cache.insert(key, fused.clone());
        Ok(fused)
    }

    /// Observed state of the segment's current local day, when `contract`
    /// settles on it and same-day gating is on.
    async fn same_day(
        &self,
        segment_id: &str,
        contract: &MarketContract,
        now: DateTime<Utc>,
    ) -> Option<SameDay> {
        if !self.observation_gate.enabled() {
            return None;
        }
        let segment = self.config.segment(segment_id)?;
        let local_now = segment.local(now);
        let today = local_now.date_naive();
        if segment.local(contract.settles_at).date_naive() != today {
            return None;
        }
        let observed = match &self.observations {
            Some(source) => {
                let timeout = Duration::from_millis(self.config.engine.fetch_timeout_ms.max(1));
                let fetched = tokio::time::timeout(
                    timeout,
                    source.observed_extreme(segment_id, today, segment.extreme),
                )
                .await;
                match fetched {
                    Ok(Ok(observation)) => observation.map(|o| o.value),
                    Ok(Err(e)) => {
                        tracing::warn!(
                            segment = %segment_id,
                            source = source.source_id(),
                            error = %e,
                            "observation fetch failed"
                        );
                        None
                    }
                    Err(_) => {
                        tracing::warn!(
                            segment = %segment_id,
                            source = source.source_id(),
                            "observation fetch timed out"
                        );
                        None
                    }
                }
            }
            None => None,
        };
        Some(SameDay::at(segment.extreme, local_now, observed))
    }

    /// Sell open entries whose price or model has moved against holding them.
    async fn manage_exits(&mut self, now: DateTime<Utc>, report: &mut CycleReport) {
        if !self.config.exit.enabled {
            return;
        }
        let open: Vec<EntryContext> = self
            .store
            .entries()
            .into_iter()
            .filter(|e| e.target_time > now)
            .filter(|e| !e.entered_at.is_some_and(|t| now - t < self.min_hold))
            .cloned()
            .collect();

        for entry in open {
            let gateway = self.gateway.clone();
            let book = match with_retry(&self.retry, "get_orderbook", || {
                gateway.get_orderbook(&entry.contract_id)
            })
            .await
            {
                Ok(book) => book,
                Err(e) => {
                    tracing::warn!(
                        contract = %entry.contract_id,
                        error = %e,
                        "order book unavailable for exit check"
                    );
                    continue;
                }
            };
            let Some(bid) = book.best_bid(entry.side) else {
                continue;
            };
            let Some((code, reason)) = self.exit_trigger(&entry, bid, &book, now).await else {
                continue;
            };
            if let Some(decision) = self.execute_exit(&entry, bid, code, reason, now).await {
                report.exits_executed += 1;
                report.decisions.push(decision);
            }
        }
    }

    async fn exit_trigger(
        &mut self,
        entry: &EntryContext,
        bid: u32,
        book: &OrderBook,
        now: DateTime<Utc>,
    ) -> Option<(ReasonCode, String)> {
        let take_profit = self.config.exit.take_profit_pct;
        let stop_loss = self.config.exit.stop_loss_pct;
        let entry_cents = entry.entry_price_cents.max(1) as f64;
        let profit_pct = (bid as f64 - entry_cents) / entry_cents * 100.0;
        if profit_pct >= take_profit {
            return Some((
                ReasonCode::ExitTakeProfit,
                format!("bid {bid}c is {profit_pct:+.1}% on entry {}c", entry.entry_price_cents),
            ));
        }
        if profit_pct <= -stop_loss {
            return Some((
                ReasonCode::ExitStopLoss,
                format!("bid {bid}c is {profit_pct:+.1}% on entry {}c", entry.entry_price_cents),
            ));
        }
        if !self.config.exit.edge_gone {
            return None;
        }

        let strike = self.store.get(&entry.contract_id)?.contract.strike;
        let fused = match self.fused_for(&entry.segment_id, entry.target_time, now).await {
            Ok(fused) => fused,
            Err(e) => {
                tracing::debug!(
                    contract = %entry.contract_id,
                    reason = %e,
                    "no fresh distribution for exit check"
                );
                return None;
            }
        };
        let p_yes = fused.distribution.probability_of(&strike);
        let edge = self.evaluator.edge_gone(entry.side, p_yes, book)?;
        Some((
            ReasonCode::ExitEdgeGone,
            format!(
                "edge {edge:.1}% on held {} below {:.1}% (P(yes) {p_yes:.3})",
                entry.side, self.config.edge.min_edge_pct
            ),
        ))
    }

    async fn execute_exit(
        &mut self,
        entry: &EntryContext,
        bid: u32,
        code: ReasonCode,
        reason: String,
        now: DateTime<Utc>,
    ) -> Option<DecisionRecord> {
        if !self.breaker.can_submit() {
            tracing::warn!(
                contract = %entry.contract_id,
                reason_code = code.as_str(),
                "exit deferred; order placement stopped for this cycle"
            );
            return None;
        }

        // One tick under the bid so the sell crosses.
        let limit = bid.saturating_sub(1).max(1);
        let order = OrderRequest::sell(&entry.contract_id, entry.side, entry.contracts, limit);
        let gateway = self.gateway.clone();
        let submitted =
            with_retry(&self.retry, "place_order", || gateway.place_order(&order)).await;
        let ack = match submitted {
            Ok(ack) => {
                self.breaker.record_success();
                ack
            }
            Err(e) => {
                self.breaker.record_failure(&e.to_string());
                tracing::warn!(
                    contract = %entry.contract_id,
                    client_order_id = %order.client_order_id,
                    error = %e,
                    "exit submission failed"
                );
                return None;
            }
        };
        if ack.filled == 0 {
            tracing::info!(
                contract = %entry.contract_id,
                reason_code = code.as_str(),
                limit_cents = limit,
                "exit order not filled"
            );
            return None;
        }

        let exit_cents = ack
            .avg_price_cents
            .unwrap_or(limit as f64)
            .round()
            .clamp(1.0, 99.0) as u32;
        tracing::info!(
            contract = %entry.contract_id,
            segment = %entry.segment_id,
            side = %entry.side,
            action = order.action.as_str(),
            reason_code = code.as_str(),
            reason = %reason,
            contracts = ack.filled,
            entry_cents = entry.entry_price_cents,
            exit_cents,
            order_id = %ack.order_id,
            decision = "exit",
            "position exited"
        );
        if let Err(e) = self.settlement.apply_exit(
            entry,
            ack.filled,
            exit_cents,
            now,
            &mut self.state,
            &self.governor,
        ) {
            tracing::error!(
                contract = %entry.contract_id,
                error = %format!("{e:#}"),
                "exit not fully recorded"
            );
        }
        if let Err(e) = self.store.reduce_entry(&entry.contract_id, ack.filled) {
            tracing::error!(
                contract = %entry.contract_id,
                error = %format!("{e:#}"),
                "failed to persist entry"
            );
        }
        let decision = DecisionRecord::exited(
            &entry.contract_id,
            &entry.segment_id,
            entry.side,
            ack.filled,
            code,
            reason,
            now,
        );
        self.store
            .mark_decided(&entry.contract_id, self.cycle, decision.clone());
        Some(decision)
    }

    async fn exposure(&self) -> EngineResult<ExposureBook> {
        let gateway = self.gateway.clone();
        let positions = with_retry(&self.retry, "get_positions", || gateway.get_positions()).await?;
        let resting =
            with_retry(&self.retry, "get_resting_orders", || gateway.get_resting_orders()).await?;
        Ok(ExposureBook::from_snapshot(&positions, &resting))
    }

    fn held_positions(&self, exposure: &ExposureBook) -> Vec<HeldPosition> {
        exposure
            .positions()
            .iter()
            .map(|p| HeldPosition {
                contract_id: p.contract_id.clone(),
                event_id: market_key(&p.contract_id).to_string(),
                segment_id: self.store.segment_of(&p.contract_id).map(str::to_string),
                side: p.side,
                count: p.count,
            })
            .collect()
    }

    fn reject(
        contract: &MarketContract,
        side: Option<crate::model::Side>,
        code: ReasonCode,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DecisionRecord {
        let reason = reason.into();
        tracing::info!(
            contract = %contract.contract_id,
            segment = %contract.segment_id,
            decision = "reject",
            reason_code = code.as_str(),
            reason = %reason,
            "trade declined"
        );
        DecisionRecord::rejected(
            &contract.contract_id,
            &contract.segment_id,
            side,
            code,
            reason,
            now,
        )
    }

    async fn decide(
        &mut self,
        contract: &MarketContract,
        fused: &FusedEstimate,
        same_day: Option<&SameDay>,
        now: DateTime<Utc>,
    ) -> DecisionRecord {
        if !self.store.begin(&contract.contract_id, self.cycle) {
            return Self::reject(
                contract,
                None,
                ReasonCode::PipelineContractInFlight,
                "already decided this cycle",
                now,
            );
        }
        if let Some(day) = same_day {
            let mean = fused.distribution.mean();
            if let Some((code, reason)) = self.observation_gate.check(&contract.strike, day, mean) {
                return Self::reject(contract, None, code, reason, now);
            }
        }

        let gate = match self.state.segments.gate(&contract.segment_id, now) {
            Ok(gate) => gate,
            Err(e) => {
                tracing::error!(
                    segment = %contract.segment_id,
                    error = %format!("{e:#}"),
                    "segment state write failed"
                );
                return Self::reject(
                    contract,
                    None,
                    ReasonCode::AdaptiveInconsistentState,
                    e.to_string(),
                    now,
                );
            }
        };
        if !gate.allowed {
            return Self::reject(
                contract,
                None,
                gate.code.unwrap_or(ReasonCode::AdaptiveSegmentDisabled),
                gate.reason.clone().unwrap_or_default(),
                now,
            );
        }
        if let Some(blocked) = self.governor.pre_check(self.state.risk.state(), now) {
            return Self::reject(
                contract,
                None,
                blocked.reason_code.unwrap_or(ReasonCode::RiskDrawdownPaused),
                blocked.reason.unwrap_or_default(),
                now,
            );
        }

        let gateway = self.gateway.clone();
        let book = match with_retry(&self.retry, "get_orderbook", || {
            gateway.get_orderbook(&contract.contract_id)
        })
        .await
        {
            Ok(book) => book,
            Err(e) => {
                tracing::warn!(
                    contract = %contract.contract_id,
                    error = %e,
                    "order book unavailable"
                );
                return Self::reject(
                    contract,
                    None,
                    ReasonCode::EdgeNoLiquidity,
                    format!("order book unavailable: {e}"),
                    now,
                );
            }
        };

        let p_yes = fused.distribution.probability_of(&contract.strike);
        let interval = self.bootstrap.interval(
            &fused.estimates(),
            &fused.weights(),
            fused.distribution.spread(),
            &contract.strike,
        );
        let edge_multiplier = self.governor.edge_multiplier(self.state.risk.state());
        let outcome = self.evaluator.evaluate(&EdgeInput {
            contract,
            p_yes,
            interval: &interval,
            distribution_mean: fused.distribution.mean(),
            book: &book,
            size_hint: self.config.sizing.base_contracts.max(1),
            source_count: fused.source_count(),
            edge_multiplier,
        });
        let candidate = match outcome {
            EdgeOutcome::Accepted(candidate) => candidate,
            EdgeOutcome::Declined(decline) => {
                tracing::debug!(
                    contract = %contract.contract_id,
                    p_yes,
                    reason_code = decline.code.as_str(),
                    reason = %decline.reason,
                    "no edge"
                );
                return DecisionRecord::rejected(
                    &contract.contract_id,
                    &contract.segment_id,
                    decline.side,
                    decline.code,
                    decline.reason,
                    now,
                );
            }
        };

        self.size_and_submit(contract, &candidate, fused, &book, &gate, now)
            .await
    }

    async fn size_and_submit(
        &mut self,
        contract: &MarketContract,
        candidate: &TradeCandidate,
        fused: &FusedEstimate,
        book: &crate::model::OrderBook,
        gate: &crate::adaptive::SegmentGate,
        now: DateTime<Utc>,
    ) -> DecisionRecord {
        // Positions may have moved since the cycle started.
        let exposure = match self.exposure().await {
            Ok(exposure) => exposure,
            Err(e) => {
                tracing::warn!(
                    contract = %contract.contract_id,
                    error = %e,
                    "exposure refresh failed"
                );
                return Self::reject(
                    contract,
                    Some(candidate.side),
                    ReasonCode::GatewaySubmitFailed,
                    format!("exposure refresh failed: {e}"),
                    now,
                );
            }
        };
        self.state.risk.set_exposure(&exposure);

        let risk = self.governor.evaluate(
            &RiskRequest {
                contract_id: &contract.contract_id,
                side: candidate.side,
                price_cents: candidate.fill_price_cents,
            },
            self.state.risk.state(),
            &exposure,
            now,
        );
        let held = self.held_positions(&exposure);
        let sizing = self.sizer.size(&SizingInput {
            candidate,
            book,
            held: &held,
            bankroll_dollars: self.config.engine.bankroll_dollars,
            gate,
            risk: &risk,
            now,
        });
        if sizing.contracts == 0 {
            return Self::reject(
                contract,
                Some(candidate.side),
                sizing.reason_code.unwrap_or(ReasonCode::SizingBelowMinimum),
                sizing.reason.unwrap_or_default(),
                now,
            );
        }

        if !self.breaker.can_submit() {
            return Self::reject(
                contract,
                Some(candidate.side),
                ReasonCode::GatewayCircuitOpen,
                "order placement stopped for this cycle",
                now,
            );
        }

        let order = OrderRequest::new(
            &contract.contract_id,
            candidate.side,
            sizing.contracts,
            sizing.limit_price_cents,
        );
        let gateway = self.gateway.clone();
        match with_retry(&self.retry, "place_order", || gateway.place_order(&order)).await {
            Ok(ack) => {
                self.breaker.record_success();
                tracing::info!(
                    contract = %contract.contract_id,
                    segment = %contract.segment_id,
                    side = %candidate.side,
                    mode = candidate.mode.as_str(),
                    contracts = order.count,
                    filled = ack.filled,
                    limit_cents = order.price_cents,
                    fill_cents = sizing.fill_price_cents,
                    probability = candidate.model_probability,
                    edge_pct = candidate.edge_pct,
                    ev = candidate.expected_value,
                    order_id = %ack.order_id,
                    decision = "submit",
                    "order placed"
                );
                let entry = EntryContext {
                    contract_id: contract.contract_id.clone(),
                    segment_id: contract.segment_id.clone(),
                    side: candidate.side,
                    entry_price_cents: sizing.fill_price_cents.round().clamp(1.0, 99.0) as u32,
                    contracts: order.count,
                    model_probability: candidate.model_probability,
                    fused_mean: fused.distribution.mean(),
                    source_estimates: fused.raw_by_source.clone(),
                    target_time: contract.settles_at,
                    entered_at: Some(now),
                };
                if let Err(e) = self.store.record_entry(entry) {
                    tracing::error!(
                        contract = %contract.contract_id,
                        error = %format!("{e:#}"),
                        "failed to persist entry"
                    );
                }
                if let Err(e) = self.state.segments.record_entry(&contract.segment_id) {
                    tracing::error!(
                        segment = %contract.segment_id,
                        error = %format!("{e:#}"),
                        "failed to persist segment state"
                    );
                }
                DecisionRecord::approved(
                    &contract.contract_id,
                    &contract.segment_id,
                    candidate.side,
                    order.count,
                    now,
                )
            }
            Err(e) => {
                self.breaker.record_failure(&e.to_string());
                tracing::warn!(
                    contract = %contract.contract_id,
                    client_order_id = %order.client_order_id,
                    error = %e,
                    "order submission failed"
                );
                DecisionRecord::rejected(
                    &contract.contract_id,
                    &contract.segment_id,
                    Some(candidate.side),
                    ReasonCode::GatewaySubmitFailed,
                    e.to_string(),
                    now,
                )
            }
        }
    }

    /// Rebuild the calibration report only when the outcome log has grown.
    fn refresh_calibration(&mut self) {
        let rows = match self.settlement.log().count() {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "outcome log count failed");
                return;
            }
        };
        if rows == self.calibrated_rows {
            return;
        }
        match self.settlement.log().all() {
            Ok(records) => {
                self.calibration = calibration_report(&records);
                self.calibrated_rows = rows;
            }
            Err(e) => tracing::warn!(error = %e, "outcome log read failed"),
        }
    }

    pub fn calibration(&self) -> &CalibrationReport {
        &self.calibration
    }

    pub fn snapshot(&self, now: DateTime<Utc>, decisions: &[DecisionRecord]) -> EngineSnapshot {
        EngineSnapshot {
            cycle: self.cycle,
            updated_at: Some(now),
            segments: self.state.segments.snapshot(),
            segments_corrupt: self.state.segments.is_corrupt(),
            risk: Some(self.state.risk.state().clone()),
            breaker: Some(self.breaker.stats()),
            sources: self.state.weighting.profiles(),
            calibration: self.calibration.clone(),
            decisions: decisions.to_vec(),
            open_entries: self.store.entries().len(),
        }
    }

    fn publish(&self, now: DateTime<Utc>, decisions: &[DecisionRecord]) {
        let snapshot = self.snapshot(now, decisions);
        self.snapshot_tx.send_replace(snapshot);
    }
}
