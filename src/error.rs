use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// No usable records for a segment/time. Skipped, not reported as a failure.
    #[error("data unavailable for {segment_id}: {detail}")]
    DataUnavailable { segment_id: String, detail: String },

    #[error("model degenerate for {segment_id}: {detail}")]
    ModelDegenerate { segment_id: String, detail: String },

    #[error("external failure ({target}): {detail}")]
    ExternalFailure { target: String, detail: String },

    #[error("risk limit exceeded ({reason_code}): {reason}")]
    RiskLimitExceeded { reason_code: String, reason: String },

    #[error("inconsistent state ({scope}): {detail}")]
    InconsistentState { scope: String, detail: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn data_unavailable(segment_id: &str, detail: impl Into<String>) -> Self {
        Self::DataUnavailable {
            segment_id: segment_id.to_string(),
            detail: detail.into(),
        }
    }

    pub fn degenerate(segment_id: &str, detail: impl Into<String>) -> Self {
        Self::ModelDegenerate {
            segment_id: segment_id.to_string(),
            detail: detail.into(),
        }
    }

    pub fn external(target: &str, detail: impl Into<String>) -> Self {
        Self::ExternalFailure {
            target: target.to_string(),
            detail: detail.into(),
        }
    }

    pub fn inconsistent(scope: &str, detail: impl Into<String>) -> Self {
        Self::InconsistentState {
            scope: scope.to_string(),
            detail: detail.into(),
        }
    }

    /// Errors that only skip the current segment for this cycle.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::DataUnavailable { .. }
                | Self::ModelDegenerate { .. }
                | Self::ExternalFailure { .. }
                | Self::RiskLimitExceeded { .. }
                | Self::Http(_)
        )
    }

    /// Normal "no trade" outcomes that must not be logged as failures.
    pub fn is_expected_skip(&self) -> bool {
        matches!(
            self,
            Self::DataUnavailable { .. }
                | Self::ModelDegenerate { .. }
                | Self::RiskLimitExceeded { .. }
        )
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
