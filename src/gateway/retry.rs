use std::future::Future;
use std::time::Duration;

use crate::config::GatewayConfig;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl RetryPolicy {
    pub fn from_config(cfg: &GatewayConfig) -> Self {
        Self {
            timeout: Duration::from_millis(cfg.request_timeout_ms.max(1)),
            max_attempts: cfg.max_attempts.max(1),
            initial: Duration::from_millis(cfg.backoff_initial_ms),
            max: Duration::from_millis(cfg.backoff_max_ms),
            factor: cfg.backoff_factor.max(1.0),
        }
    }

    /// Sleep before retrying after failed attempt number `attempt` (1-based):
    /// `initial * factor^(attempt - 1)`, capped at `max`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.initial.as_secs_f64() * self.factor.powi(exponent);
        if secs.is_finite() && secs < self.max.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max
        }
    }
}

/// Run `op` with a per-attempt timeout, retrying recoverable failures.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::external(
                label,
                format!("timed out after {}ms", policy.timeout.as_millis()),
            )),
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_recoverable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    target_call = %label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "gateway call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
