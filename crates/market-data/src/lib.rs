//! Provider adapters that fetch cash-flow statements and quotes from upstream
//! market-data services and map them into canonical `FinancialStatements`.

use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;
use valuation_core::{CashFlowPeriod, Granularity, ValuationError, MIN_SERIES_LEN};

pub mod alpha_vantage;
pub mod fields;
pub mod polygon;
pub mod rate_limit;
pub mod yahoo;

pub use alpha_vantage::AlphaVantageProvider;
pub use fields::{FieldPath, FieldSynonyms};
pub use polygon::PolygonProvider;
pub use rate_limit::RateLimiter;
pub use yahoo::YahooFinanceProvider;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

pub(crate) fn build_http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Map a non-success HTTP status onto the failure taxonomy.
pub fn classify_status(provider: &str, status: StatusCode, body: &str) -> ValuationError {
    let snippet: String = body.chars().take(200).collect();
    match status.as_u16() {
        429 => ValuationError::RateLimited(format!("{} returned HTTP 429", provider)),
        404 => ValuationError::UpstreamMalformed(format!("{}: not found ({})", provider, snippet)),
        _ => ValuationError::UpstreamUnavailable(format!("{} HTTP {}: {}", provider, status, snippet)),
    }
}

/// Periods from which a free cash flow can be derived.
pub fn usable_periods(periods: &[CashFlowPeriod]) -> usize {
    periods.iter().filter(|p| p.derived_fcf().is_some()).count()
}

/// Fewer usable periods than a series needs.
pub(crate) fn too_thin(periods: &[CashFlowPeriod]) -> bool {
    usable_periods(periods) < MIN_SERIES_LEN
}

/// Keep annual statements unless the quarterly ones carry more usable periods.
pub(crate) fn pick_periods(
    annual: Vec<CashFlowPeriod>,
    quarterly: Vec<CashFlowPeriod>,
) -> (Granularity, Vec<CashFlowPeriod>) {
    if usable_periods(&quarterly) > usable_periods(&annual) {
        (Granularity::Quarterly, quarterly)
    } else {
        (Granularity::Annual, annual)
    }
}

fn transport_error(provider: &str, err: reqwest::Error) -> ValuationError {
    if err.is_timeout() {
        ValuationError::UpstreamUnavailable(format!("{} request timed out", provider))
    } else {
        ValuationError::UpstreamUnavailable(format!("{} transport error: {}", provider, err))
    }
}

/// Send a GET and decode the JSON body, classifying every failure.
pub(crate) async fn send_json(
    provider: &str,
    builder: RequestBuilder,
    timeout: Duration,
) -> Result<Value, ValuationError> {
    let response = builder
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| transport_error(provider, e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::warn!("{} responded with HTTP {}", provider, status);
        return Err(classify_status(provider, status, &body));
    }

    response.json::<Value>().await.map_err(|e| {
        ValuationError::UpstreamMalformed(format!("{} returned invalid JSON: {}", provider, e))
    })
}
