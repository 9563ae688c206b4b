use async_trait::async_trait;
use chrono::DateTime;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use valuation_core::{
    CashFlowPeriod, FinancialDataProvider, FinancialStatements, Granularity, MarketSnapshot,
    PeriodOrder, PricePoint, Ticker, ValuationError,
};

use crate::fields::{first_numeric_at, numeric_value, FieldPath, FieldSynonyms};
use crate::{build_http_client, pick_periods, send_json, too_thin, RateLimiter};

const BASE_URL: &str = "https://query2.finance.yahoo.com";
const PROVIDER: &str = "yahoo";
const SUMMARY_MODULES: &str = "cashflowStatementHistory,cashflowStatementHistoryQuarterly,price,defaultKeyStatistics,financialData";

pub const YAHOO_FIELDS: FieldSynonyms = FieldSynonyms {
    operating_cash_flow: &[
        "totalCashFromOperatingActivities",
        "operatingCashflow",
        "operatingCashFlow",
    ],
    capital_expenditure: &["capitalExpenditures", "capitalExpenditure"],
    free_cash_flow: &["freeCashFlow", "freeCashflow"],
    period_end: &["endDate"],
};

const PRICE_PATHS: &[FieldPath] = &[
    &["price", "regularMarketPrice"],
    &["financialData", "currentPrice"],
];
const SHARES_PATHS: &[FieldPath] = &[
    &["defaultKeyStatistics", "sharesOutstanding"],
    &["defaultKeyStatistics", "impliedSharesOutstanding"],
];
const MARKET_CAP_PATHS: &[FieldPath] = &[&["price", "marketCap"]];
const EPS_PATHS: &[FieldPath] = &[
    &["defaultKeyStatistics", "trailingEps"],
    &["price", "epsTrailingTwelveMonths"],
];

/// Yahoo Finance quoteSummary adapter. Statements, quote and share count
/// arrive in a single call.
#[derive(Clone)]
pub struct YahooFinanceProvider {
    client: Client,
    base_url: String,
    rate_limiter: RateLimiter,
    timeout: Duration,
}

impl YahooFinanceProvider {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: build_http_client(timeout),
            base_url: BASE_URL.to_string(),
            rate_limiter: RateLimiter::per_minute(60, Duration::from_secs(2)),
            timeout,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, ValuationError> {
        self.rate_limiter.acquire().await?;
        let builder = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(query);
        send_json(PROVIDER, builder, self.timeout).await
    }
}

impl Default for YahooFinanceProvider {
    fn default() -> Self {
        Self::new(crate::DEFAULT_TIMEOUT)
    }
}

#[async_trait]
impl FinancialDataProvider for YahooFinanceProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn fetch_financials(&self, ticker: &Ticker) -> Result<FinancialStatements, ValuationError> {
        let body = self
            .get(
                &format!("/v10/finance/quoteSummary/{}", ticker),
                &[("modules", SUMMARY_MODULES)],
            )
            .await?;
        let summary = summary_result(&body)?;

        let annual = parse_cash_flows(summary, Granularity::Annual);
        let (granularity, periods) = if too_thin(&annual) {
            tracing::info!("Annual cash flows for {} on Yahoo are too thin, trying quarterly", ticker);
            pick_periods(annual, parse_cash_flows(summary, Granularity::Quarterly))
        } else {
            (Granularity::Annual, annual)
        };

        Ok(FinancialStatements {
            ticker: ticker.clone(),
            provider: PROVIDER.to_string(),
            granularity,
            order: PeriodOrder::NewestFirst,
            periods,
            market: parse_market(summary),
        })
    }

    async fn fetch_price_history(
        &self,
        ticker: &Ticker,
        days: u32,
    ) -> Result<Vec<PricePoint>, ValuationError> {
        let range = format!("{}d", days);
        let body = self
            .get(
                &format!("/v8/finance/chart/{}", ticker),
                &[("range", range.as_str()), ("interval", "1d")],
            )
            .await?;
        parse_chart(&body)
    }
}

/// Unwrap `quoteSummary.result[0]`, surfacing Yahoo's own error object.
pub fn summary_result(body: &Value) -> Result<&Value, ValuationError> {
    let summary = body.get("quoteSummary").ok_or_else(|| {
        ValuationError::UpstreamMalformed("yahoo response missing quoteSummary".to_string())
    })?;

    if let Some(error) = summary.get("error").filter(|e| !e.is_null()) {
        let description = error
            .get("description")
            .and_then(|d| d.as_str())
            .unwrap_or("unknown error");
        return Err(ValuationError::UpstreamMalformed(format!("yahoo: {}", description)));
    }

    summary
        .get("result")
        .and_then(|r| r.as_array())
        .and_then(|arr| arr.first())
        .ok_or_else(|| ValuationError::UpstreamMalformed("yahoo quoteSummary has no result".to_string()))
}

pub fn parse_cash_flows(summary: &Value, granularity: Granularity) -> Vec<CashFlowPeriod> {
    let module = match granularity {
        Granularity::Annual => "cashflowStatementHistory",
        Granularity::Quarterly => "cashflowStatementHistoryQuarterly",
    };
    summary
        .get(module)
        .and_then(|m| m.get("cashflowStatements"))
        .and_then(|s| s.as_array())
        .map(|statements| {
            statements
                .iter()
                .map(|statement| YAHOO_FIELDS.extract_period(statement, statement))
                .collect()
        })
        .unwrap_or_default()
}

pub fn parse_market(summary: &Value) -> MarketSnapshot {
    MarketSnapshot {
        current_price: first_numeric_at(summary, PRICE_PATHS).filter(|p| *p > 0.0),
        shares_outstanding: first_numeric_at(summary, SHARES_PATHS),
        market_cap: first_numeric_at(summary, MARKET_CAP_PATHS),
        trailing_eps: first_numeric_at(summary, EPS_PATHS),
    }
}

pub fn parse_chart(body: &Value) -> Result<Vec<PricePoint>, ValuationError> {
    let chart = body
        .get("chart")
        .and_then(|c| c.get("result"))
        .and_then(|r| r.as_array())
        .and_then(|arr| arr.first())
        .ok_or_else(|| ValuationError::UpstreamMalformed("yahoo chart has no result".to_string()))?;

    let timestamps = chart
        .get("timestamp")
        .and_then(|t| t.as_array())
        .cloned()
        .unwrap_or_default();
    let closes = chart
        .get("indicators")
        .and_then(|i| i.get("quote"))
        .and_then(|q| q.as_array())
        .and_then(|arr| arr.first())
        .and_then(|q| q.get("close"))
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default();

    Ok(timestamps
        .iter()
        .zip(closes.iter())
        .filter_map(|(ts, close)| {
            let timestamp = ts.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0))?;
            let close = numeric_value(close)?;
            Some(PricePoint { timestamp, close })
        })
        .collect())
}
