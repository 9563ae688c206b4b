use serde::{Deserialize, Serialize};
use valuation_core::ValuationError;

use crate::DcfValuation;

/// Assumptions for the EPS proxy strategy, used when no usable cash-flow
/// history exists. Lower fidelity than the direct DCF.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpsProxyAssumptions {
    pub growth_rate: f64,
    pub discount_rate: f64,
    pub years: u32,
    pub terminal_multiple: f64,
}

impl Default for EpsProxyAssumptions {
    fn default() -> Self {
        Self {
            growth_rate: 0.08,
            discount_rate: 0.10,
            years: 5,
            terminal_multiple: 15.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EpsProxyValuator {
    pub assumptions: EpsProxyAssumptions,
}

impl EpsProxyValuator {
    pub fn new(assumptions: EpsProxyAssumptions) -> Self {
        Self { assumptions }
    }

    /// Project EPS `years` forward at `growth_rate`, capitalize with the
    /// terminal multiple and discount back.
    pub fn valuate(&self, trailing_eps: f64, shares: Option<f64>) -> Result<DcfValuation, ValuationError> {
        let a = self.assumptions;
        if a.years == 0 || !a.terminal_multiple.is_finite() || a.discount_rate <= -1.0 {
            return Err(ValuationError::InvalidAssumptions(format!(
                "invalid EPS proxy assumptions: {:?}",
                a
            )));
        }
        if !trailing_eps.is_finite() || trailing_eps == 0.0 {
            return Err(ValuationError::DataIncomplete(
                "trailing EPS unavailable".to_string(),
            ));
        }

        let years = a.years as i32;
        let projected_eps = trailing_eps * (1.0 + a.growth_rate).powi(years);
        let terminal_value = projected_eps * a.terminal_multiple;
        let fair_value = terminal_value / (1.0 + a.discount_rate).powi(years);

        let shares = shares.filter(|s| *s > 0.0 && s.is_finite());
        Ok(DcfValuation {
            present_value: shares.map_or(fair_value, |s| fair_value * s),
            terminal_value,
            intrinsic_price_per_share: Some(fair_value),
            years_used: a.years as usize,
        })
    }
}
