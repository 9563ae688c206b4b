use thiserror::Error;

use crate::AnalysisStatus;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValuationError {
    #[error("Invalid ticker: {0}")]
    InvalidTicker(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Upstream data malformed: {0}")]
    UpstreamMalformed(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Insufficient history: {usable} usable periods, need at least {required}")]
    InsufficientHistory { usable: usize, required: usize },

    #[error("Invalid assumptions: {0}")]
    InvalidAssumptions(String),

    #[error("Data incomplete: {0}")]
    DataIncomplete(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ValuationError {
    /// Status tag surfaced to callers so they can decide whether to retry.
    pub fn status(&self) -> AnalysisStatus {
        match self {
            ValuationError::RateLimited(_) => AnalysisStatus::RateLimited,
            ValuationError::UpstreamUnavailable(_) | ValuationError::DataIncomplete(_) => {
                AnalysisStatus::Queued
            }
            _ => AnalysisStatus::Error,
        }
    }

    /// Expected, data-driven failures (bad input, thin history, throttling).
    /// Anything else is unexpected and worth an error-level log line.
    pub fn is_expected(&self) -> bool {
        !matches!(self, ValuationError::Internal(_))
    }
}
