use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ValuationError;

const MAX_TICKER_LEN: usize = 16;

/// Normalized (trimmed, uppercased) stock symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticker(String);

impl Ticker {
    pub fn parse(raw: &str) -> Result<Self, ValuationError> {
        let normalized = raw.trim().to_uppercase();
        if normalized.is_empty() {
            return Err(ValuationError::InvalidTicker("Ticker required".to_string()));
        }
        let valid_chars = normalized
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | '='));
        if normalized.len() > MAX_TICKER_LEN || !valid_chars {
            return Err(ValuationError::InvalidTicker(format!(
                "Invalid ticker symbol: at most {} letters, digits or .-^=",
                MAX_TICKER_LEN
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Ticker {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Reporting granularity of a cash-flow statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Annual,
    Quarterly,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Annual => "annual",
            Granularity::Quarterly => "quarterly",
        }
    }
}

/// Native array order of the periods a provider returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodOrder {
    OldestFirst,
    NewestFirst,
}

/// One reporting period's cash-flow figures, already mapped to canonical names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CashFlowPeriod {
    #[serde(default)]
    pub period_end: Option<NaiveDate>,
    pub operating_cash_flow: Option<f64>,
    pub capital_expenditure: Option<f64>,
    pub free_cash_flow: Option<f64>,
}

impl CashFlowPeriod {
    /// Explicit FCF wins; otherwise OCF - |capex| when both are known.
    pub fn derived_fcf(&self) -> Option<f64> {
        let fcf = match (self.free_cash_flow, self.operating_cash_flow, self.capital_expenditure) {
            (Some(fcf), _, _) => Some(fcf),
            (None, Some(ocf), Some(capex)) => Some(ocf - capex.abs()),
            _ => None,
        };
        fcf.filter(|v| v.is_finite())
    }
}

/// Current market data for a ticker. Every field may be absent upstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub current_price: Option<f64>,
    pub shares_outstanding: Option<f64>,
    #[serde(default)]
    pub market_cap: Option<f64>,
    #[serde(default)]
    pub trailing_eps: Option<f64>,
}

/// Raw financials for one ticker as returned by a provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialStatements {
    pub ticker: Ticker,
    pub provider: String,
    pub granularity: Granularity,
    pub order: PeriodOrder,
    pub periods: Vec<CashFlowPeriod>,
    pub market: MarketSnapshot,
}

/// Daily close used for volatility and drawdown signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub close: f64,
}

pub const MIN_SERIES_LEN: usize = 2;

/// Chronological (oldest first) free-cash-flow values.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FcfSeries(Vec<f64>);

impl FcfSeries {
    pub fn new(values: Vec<f64>) -> Result<Self, ValuationError> {
        if values.len() < MIN_SERIES_LEN {
            return Err(ValuationError::InsufficientHistory {
                usable: values.len(),
                required: MIN_SERIES_LEN,
            });
        }
        // Period extraction drops non-finite values, so one here is a bug.
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ValuationError::Internal(
                "non-finite free cash flow value reached the series".to_string(),
            ));
        }
        Ok(Self(values))
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Most recent period, the base for terminal growth.
    pub fn latest(&self) -> f64 {
        self.0[self.0.len() - 1]
    }
}

/// DCF assumptions. `discount_rate` must exceed `terminal_growth_rate`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValuationAssumptions {
    pub discount_rate: f64,
    pub terminal_growth_rate: f64,
    /// Defaults to the full series length.
    pub projection_years: Option<usize>,
}

impl Default for ValuationAssumptions {
    fn default() -> Self {
        Self {
            discount_rate: 0.10,
            terminal_growth_rate: 0.025,
            projection_years: None,
        }
    }
}

impl ValuationAssumptions {
    pub fn validate(&self) -> Result<(), ValuationError> {
        if !self.discount_rate.is_finite() || !self.terminal_growth_rate.is_finite() {
            return Err(ValuationError::InvalidAssumptions(
                "rates must be finite".to_string(),
            ));
        }
        if self.discount_rate <= -1.0 {
            return Err(ValuationError::InvalidAssumptions(format!(
                "discount rate {} must be greater than -1",
                self.discount_rate
            )));
        }
        if self.discount_rate <= self.terminal_growth_rate {
            return Err(ValuationError::InvalidAssumptions(format!(
                "discount rate {} must exceed terminal growth rate {}",
                self.discount_rate, self.terminal_growth_rate
            )));
        }
        if self.projection_years == Some(0) {
            return Err(ValuationError::InvalidAssumptions(
                "projection years must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which valuation algorithm produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValuationMode {
    /// Discount the historical free-cash-flow series directly.
    FcfHistory,
    /// Project trailing EPS forward and apply a terminal multiple.
    EpsProxy,
}

impl FromStr for ValuationMode {
    type Err = ValuationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fcf_history" | "fcf" | "dcf" => Ok(ValuationMode::FcfHistory),
            "eps_proxy" | "eps" => Ok(ValuationMode::EpsProxy),
            other => Err(ValuationError::InvalidAssumptions(format!(
                "unknown valuation mode '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValuationSignal {
    Undervalued,
    Overvalued,
    FairlyValued,
}

impl ValuationSignal {
    pub fn to_label(&self) -> &'static str {
        match self {
            ValuationSignal::Undervalued => "Undervalued",
            ValuationSignal::Overvalued => "Overvalued",
            ValuationSignal::FairlyValued => "Fairly Valued",
        }
    }
}

/// How intrinsic value is mapped onto a signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalPolicy {
    /// Strictly greater than the reference is undervalued, everything else overvalued.
    TwoWay,
    /// A symmetric fair band of `band` (fraction) around the reference.
    ThreeWay { band: f64 },
}

impl SignalPolicy {
    pub fn three_way(band: f64) -> Self {
        SignalPolicy::ThreeWay { band }
    }
}

/// Request outcome tag carried in every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Complete,
    Cached,
    Error,
    Queued,
    RateLimited,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Complete => "complete",
            AnalysisStatus::Cached => "cached",
            AnalysisStatus::Error => "error",
            AnalysisStatus::Queued => "queued",
            AnalysisStatus::RateLimited => "rate_limited",
        }
    }
}

/// Finished valuation for one ticker. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuationResult {
    pub ticker: Ticker,
    pub current_price: f64,
    pub intrinsic_value_per_share: Option<f64>,
    pub present_value: f64,
    pub valuation_status: ValuationSignal,
    pub valuation_mode: ValuationMode,
    pub signal_policy: SignalPolicy,
    pub risk_score: u8,
    pub years_used: usize,
    pub status: AnalysisStatus,
    pub analyzed_at: DateTime<Utc>,
}

impl ValuationResult {
    pub fn with_status(&self, status: AnalysisStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}
