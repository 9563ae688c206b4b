//! Free-cash-flow valuation: series normalization, discounted-cash-flow and
//! EPS-proxy strategies, valuation signal bands and risk scoring.

pub mod dcf;
pub mod proxy;
pub mod risk;
pub mod series;
pub mod signal;

pub use dcf::{DcfValuation, DcfValuator};
pub use proxy::{EpsProxyAssumptions, EpsProxyValuator};
pub use risk::{
    CashFlowDispersionScorer, RiskPolicy, RiskScorer, RiskSignals, ValuationGapScorer,
    WeightedRiskScorer,
};
pub use series::FcfSeriesBuilder;
pub use signal::{classify, valuation_gap};
