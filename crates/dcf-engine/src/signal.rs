use valuation_core::{SignalPolicy, ValuationSignal};

/// Classify `intrinsic` against `reference` (current price, or market cap
/// when no per-share value exists).
///
/// Three-way bands are inclusive on both edges: exactly `reference * (1 + band)`
/// is still fairly valued.
pub fn classify(policy: SignalPolicy, intrinsic: f64, reference: f64) -> ValuationSignal {
    match policy {
        SignalPolicy::TwoWay => {
            if intrinsic > reference {
                ValuationSignal::Undervalued
            } else {
                ValuationSignal::Overvalued
            }
        }
        SignalPolicy::ThreeWay { band } => {
            let upper = reference * (1.0 + band);
            let lower = reference * (1.0 - band);
            if intrinsic > upper {
                ValuationSignal::Undervalued
            } else if intrinsic < lower {
                ValuationSignal::Overvalued
            } else {
                ValuationSignal::FairlyValued
            }
        }
    }
}

/// Relative gap `(intrinsic - reference) / reference`; zero when the
/// reference is not positive.
pub fn valuation_gap(intrinsic: f64, reference: f64) -> f64 {
    if reference <= 0.0 || !reference.is_finite() {
        return 0.0;
    }
    (intrinsic - reference) / reference
}
