use chrono::Duration;
use dcf_engine::{EpsProxyAssumptions, RiskPolicy};
use valuation_core::{SignalPolicy, ValuationAssumptions, ValuationError, ValuationMode};

use crate::cache::{DEFAULT_CAPACITY, DEFAULT_TTL_MINUTES};

pub const FCF_SIGNAL_BAND: f64 = 0.10;
pub const EPS_PROXY_SIGNAL_BAND: f64 = 0.15;

/// Everything that shapes one valuation run. Fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub mode: ValuationMode,
    pub assumptions: ValuationAssumptions,
    pub eps_proxy: EpsProxyAssumptions,
    pub signal_policy: SignalPolicy,
    pub risk_policy: RiskPolicy,
    pub min_periods: usize,
    pub max_lookback: usize,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    /// Trading days of closes requested for the weighted risk policy.
    pub price_history_days: u32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            mode: ValuationMode::FcfHistory,
            assumptions: ValuationAssumptions::default(),
            eps_proxy: EpsProxyAssumptions::default(),
            signal_policy: SignalPolicy::three_way(FCF_SIGNAL_BAND),
            risk_policy: RiskPolicy::CashFlowDispersion,
            min_periods: 2,
            max_lookback: 5,
            cache_ttl: Duration::minutes(DEFAULT_TTL_MINUTES),
            cache_capacity: DEFAULT_CAPACITY,
            price_history_days: 365,
        }
    }
}

impl AnalyzerConfig {
    /// Defaults for the EPS proxy strategy: wider fair band, gap-based risk.
    pub fn eps_proxy() -> Self {
        Self {
            mode: ValuationMode::EpsProxy,
            signal_policy: SignalPolicy::three_way(EPS_PROXY_SIGNAL_BAND),
            risk_policy: RiskPolicy::ValuationGap,
            ..Self::default()
        }
    }

    /// Defaults for `mode`, keeping every other field at its default.
    pub fn for_mode(mode: ValuationMode) -> Self {
        match mode {
            ValuationMode::FcfHistory => Self::default(),
            ValuationMode::EpsProxy => Self::eps_proxy(),
        }
    }

    pub fn with_risk_policy(mut self, risk_policy: RiskPolicy) -> Self {
        self.risk_policy = risk_policy;
        self
    }

    pub fn validate(&self) -> Result<(), ValuationError> {
        if self.mode == ValuationMode::EpsProxy && self.risk_policy == RiskPolicy::CashFlowDispersion {
            return Err(ValuationError::InvalidAssumptions(
                "cash-flow dispersion risk needs an FCF series; use weighted or valuation_gap with eps_proxy"
                    .to_string(),
            ));
        }
        if let SignalPolicy::ThreeWay { band } = self.signal_policy {
            if !band.is_finite() || !(0.0..1.0).contains(&band) {
                return Err(ValuationError::InvalidAssumptions(format!(
                    "signal band must be in [0, 1), got {}",
                    band
                )));
            }
        }
        if self.cache_ttl <= Duration::zero() {
            return Err(ValuationError::InvalidAssumptions(
                "cache TTL must be positive".to_string(),
            ));
        }
        match self.mode {
            ValuationMode::FcfHistory => self.assumptions.validate(),
            ValuationMode::EpsProxy => Ok(()),
        }
    }
}
