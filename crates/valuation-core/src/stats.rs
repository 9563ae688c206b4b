//! Price statistics used by the weighted risk policy.

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Compute the mean of a data slice.
pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Compute sample standard deviation.
pub fn std_dev(data: &[f64]) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let m = mean(data);
    let variance = data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    variance.sqrt()
}

/// Simple period-over-period returns. Pairs with a non-positive base are skipped.
pub fn simple_returns(closes: &[f64]) -> Vec<f64> {
    closes
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

/// Annualized volatility of daily closes (sample std dev of returns * sqrt(252)).
pub fn annualized_volatility(closes: &[f64]) -> f64 {
    std_dev(&simple_returns(closes)) * TRADING_DAYS_PER_YEAR.sqrt()
}

/// Drawdown of the last close from the running peak, as a fraction in [0, 1].
pub fn drawdown_from_peak(closes: &[f64]) -> f64 {
    let Some(&last) = closes.last() else {
        return 0.0;
    };
    let peak = closes.iter().cloned().fold(f64::MIN, f64::max);
    if peak <= 0.0 {
        return 0.0;
    }
    ((peak - last) / peak).clamp(0.0, 1.0)
}
