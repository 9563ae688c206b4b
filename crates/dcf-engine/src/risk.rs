use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Market-side inputs for risk policies that look beyond the cash-flow series.
/// All fractions; zero when unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RiskSignals {
    /// Annualized volatility of daily returns.
    pub volatility: f64,
    /// Drawdown of the last close from its peak.
    pub drawdown: f64,
    /// `(intrinsic - reference) / reference`.
    pub valuation_gap: f64,
}

/// Bounded [0, 100] risk score. Higher is riskier.
pub trait RiskScorer: Send + Sync {
    fn score(&self, series: &[f64], signals: &RiskSignals) -> u8;
}

/// `(max - min) / |sum|` of the FCF series, scaled to a percentage.
///
/// A series summing to zero scores 100 instead of dividing by zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct CashFlowDispersionScorer;

impl RiskScorer for CashFlowDispersionScorer {
    fn score(&self, series: &[f64], _signals: &RiskSignals) -> u8 {
        if series.is_empty() {
            return 100;
        }
        let max = series.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = series.iter().copied().fold(f64::INFINITY, f64::min);
        let sum: f64 = series.iter().sum();

        if sum == 0.0 || !sum.is_finite() {
            return 100;
        }
        let dispersion = (max - min) / sum.abs();
        to_score((dispersion * 100.0).round())
    }
}

/// Volatility, valuation gap and drawdown weighted 40/30/30.
#[derive(Debug, Clone, Copy)]
pub struct WeightedRiskScorer {
    pub volatility_weight: f64,
    pub gap_weight: f64,
    pub drawdown_weight: f64,
}

impl Default for WeightedRiskScorer {
    fn default() -> Self {
        Self {
            volatility_weight: 40.0,
            gap_weight: 30.0,
            drawdown_weight: 30.0,
        }
    }
}

impl RiskScorer for WeightedRiskScorer {
    fn score(&self, _series: &[f64], signals: &RiskSignals) -> u8 {
        let raw = self.volatility_weight * unit(signals.volatility)
            + self.gap_weight * unit(signals.valuation_gap.abs())
            + self.drawdown_weight * unit(signals.drawdown);
        to_score(raw.round())
    }
}

/// Absolute valuation gap as a percentage, floored at 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValuationGapScorer;

impl RiskScorer for ValuationGapScorer {
    fn score(&self, _series: &[f64], signals: &RiskSignals) -> u8 {
        let pct = (signals.valuation_gap.abs() * 100.0).trunc();
        to_score(pct).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskPolicy {
    CashFlowDispersion,
    Weighted,
    ValuationGap,
}

impl RiskPolicy {
    pub fn scorer(&self) -> Box<dyn RiskScorer> {
        match self {
            RiskPolicy::CashFlowDispersion => Box::new(CashFlowDispersionScorer),
            RiskPolicy::Weighted => Box::new(WeightedRiskScorer::default()),
            RiskPolicy::ValuationGap => Box::new(ValuationGapScorer),
        }
    }

    /// Whether the policy needs daily closes from the provider.
    pub fn needs_price_history(&self) -> bool {
        matches!(self, RiskPolicy::Weighted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskPolicy::CashFlowDispersion => "dispersion",
            RiskPolicy::Weighted => "weighted",
            RiskPolicy::ValuationGap => "valuation_gap",
        }
    }
}

impl FromStr for RiskPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dispersion" | "cash_flow_dispersion" => Ok(RiskPolicy::CashFlowDispersion),
            "weighted" => Ok(RiskPolicy::Weighted),
            "valuation_gap" | "gap" => Ok(RiskPolicy::ValuationGap),
            other => Err(format!("unknown risk policy: {}", other)),
        }
    }
}

fn unit(x: f64) -> f64 {
    if x.is_finite() {
        x.clamp(0.0, 1.0)
    } else {
        1.0
    }
}

fn to_score(x: f64) -> u8 {
    if x.is_nan() {
        return 100;
    }
    x.clamp(0.0, 100.0) as u8
}
