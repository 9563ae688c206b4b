use serde::Serialize;
use valuation_core::{FcfSeries, ValuationAssumptions, ValuationError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DcfValuation {
    /// Discounted explicit-period cash flows plus discounted terminal value.
    pub present_value: f64,
    pub terminal_value: f64,
    pub intrinsic_price_per_share: Option<f64>,
    pub years_used: usize,
}

/// Direct-form DCF over a chronological FCF series.
///
/// ```text
/// PV = sum_{i=1..n} fcf[i-1] / (1+r)^i
///    + fcf[n-1] * (1+g) / (r-g) / (1+r)^n
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct DcfValuator {
    pub assumptions: ValuationAssumptions,
}

impl DcfValuator {
    pub fn new(assumptions: ValuationAssumptions) -> Self {
        Self { assumptions }
    }

    pub fn valuate(
        &self,
        series: &FcfSeries,
        shares: Option<f64>,
    ) -> Result<DcfValuation, ValuationError> {
        self.assumptions.validate()?;

        let values = series.values();
        let years = self.assumptions.projection_years.unwrap_or(values.len());
        if years > values.len() {
            return Err(ValuationError::InvalidAssumptions(format!(
                "projection years {} exceed the {} periods available",
                years,
                values.len()
            )));
        }
        let window = &values[values.len() - years..];

        let r = self.assumptions.discount_rate;
        let g = self.assumptions.terminal_growth_rate;

        let explicit: f64 = window
            .iter()
            .enumerate()
            .map(|(i, fcf)| fcf / (1.0 + r).powi(i as i32 + 1))
            .sum();

        let latest = window[window.len() - 1];
        let terminal_value = latest * (1.0 + g) / (r - g);
        let present_value = explicit + terminal_value / (1.0 + r).powi(years as i32);

        if !present_value.is_finite() {
            return Err(ValuationError::InvalidAssumptions(
                "present value is not finite".to_string(),
            ));
        }

        let intrinsic_price_per_share = match shares {
            Some(s) if s > 0.0 && s.is_finite() => Some(present_value / s),
            Some(s) => {
                tracing::warn!("Ignoring non-positive shares outstanding: {}", s);
                None
            }
            None => None,
        };

        Ok(DcfValuation {
            present_value,
            terminal_value,
            intrinsic_price_per_share,
            years_used: years,
        })
    }
}
