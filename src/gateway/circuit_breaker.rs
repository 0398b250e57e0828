//! Per-cycle breaker on order submission.
//!
//! Trips after a run of consecutive submission failures and stays open for the
//! rest of the scan cycle. Reads and settlement are not gated by it.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakerState {
    /// Submissions allowed.
    Closed,
    /// Tripped; submissions blocked until the next cycle.
    Open,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub total_trips: u32,
    pub total_failures: u32,
}

pub struct SubmitBreaker {
    max_consecutive_failures: u32,
    tripped: AtomicBool,
    consecutive_failures: AtomicU32,
    total_trips: AtomicU32,
    total_failures: AtomicU32,
}

impl std::fmt::Debug for SubmitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitBreaker")
            .field("max_consecutive_failures", &self.max_consecutive_failures)
            .field("tripped", &self.tripped.load(Ordering::Relaxed))
            .field(
                "consecutive_failures",
                &self.consecutive_failures.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl SubmitBreaker {
    pub fn new(max_consecutive_failures: u32) -> Self {
        Self {
            max_consecutive_failures: max_consecutive_failures.max(1),
            tripped: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            total_trips: AtomicU32::new(0),
            total_failures: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn can_submit(&self) -> bool {
        !self.tripped.load(Ordering::Acquire)
    }

    pub fn state(&self) -> BreakerState {
        if self.can_submit() {
            BreakerState::Closed
        } else {
            BreakerState::Open
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    /// Returns `true` if this failure tripped the breaker.
    pub fn record_failure(&self, description: &str) -> bool {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.max_consecutive_failures
            && self
                .tripped
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.total_trips.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                consecutive_failures = failures,
                last_failure = %description,
                "submit breaker tripped; order placement stopped for this cycle"
            );
            return true;
        }
        false
    }

    /// Called at the start of every scan cycle.
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        if self.tripped.swap(false, Ordering::AcqRel) {
            tracing::info!("submit breaker reset");
        }
    }

    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            state: self.state(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            total_trips: self.total_trips.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
        }
    }
}
