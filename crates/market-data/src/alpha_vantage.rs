use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use valuation_core::{
    CashFlowPeriod, FinancialDataProvider, FinancialStatements, Granularity, MarketSnapshot,
    PeriodOrder, Ticker, ValuationError,
};

use crate::fields::{first_numeric_at, FieldPath, FieldSynonyms};
use crate::{build_http_client, pick_periods, send_json, too_thin, RateLimiter};

const BASE_URL: &str = "https://www.alphavantage.co/query";
const PROVIDER: &str = "alpha_vantage";
/// Free tier budget.
const DEFAULT_REQUESTS_PER_MINUTE: usize = 5;

pub const ALPHA_VANTAGE_FIELDS: FieldSynonyms = FieldSynonyms {
    operating_cash_flow: &["operatingCashflow", "operatingCashFlow"],
    capital_expenditure: &["capitalExpenditures", "capitalExpenditure"],
    free_cash_flow: &["freeCashFlow", "freeCashflow"],
    period_end: &["fiscalDateEnding"],
};

const SHARES_PATHS: &[FieldPath] = &[&["SharesOutstanding"]];
const MARKET_CAP_PATHS: &[FieldPath] = &[&["MarketCapitalization"]];
const EPS_PATHS: &[FieldPath] = &[&["EPS"], &["DilutedEPSTTM"]];
const PRICE_PATHS: &[FieldPath] = &[&["Global Quote", "05. price"], &["Global Quote", "08. previous close"]];

/// Alpha Vantage needs three calls per ticker (cash flow, overview, quote),
/// so every call passes through a shared per-minute limiter.
#[derive(Clone)]
pub struct AlphaVantageProvider {
    api_key: String,
    client: Client,
    base_url: String,
    rate_limiter: RateLimiter,
    timeout: Duration,
    market_requires_history: bool,
}

impl AlphaVantageProvider {
    pub fn new(api_key: String, timeout: Duration) -> Self {
        Self {
            api_key,
            client: build_http_client(timeout),
            base_url: BASE_URL.to_string(),
            rate_limiter: RateLimiter::per_minute(DEFAULT_REQUESTS_PER_MINUTE, Duration::from_secs(2)),
            timeout,
            market_requires_history: true,
        }
    }

    /// When set (the default), OVERVIEW and GLOBAL_QUOTE are not spent on
    /// tickers without enough cash-flow history to value.
    pub fn with_market_requires_history(mut self, required: bool) -> Self {
        self.market_requires_history = required;
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn query(&self, function: &str, ticker: &Ticker) -> Result<Value, ValuationError> {
        self.rate_limiter.acquire().await?;
        let builder = self.client.get(&self.base_url).query(&[
            ("function", function),
            ("symbol", ticker.as_str()),
            ("apikey", self.api_key.as_str()),
        ]);
        let body = send_json(PROVIDER, builder, self.timeout).await?;
        check_body(&body)?;
        Ok(body)
    }
}

#[async_trait]
impl FinancialDataProvider for AlphaVantageProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn fetch_financials(&self, ticker: &Ticker) -> Result<FinancialStatements, ValuationError> {
        // One CASH_FLOW body carries both annual and quarterly reports
        let cash_flow = self.query("CASH_FLOW", ticker).await?;
        let annual = parse_cash_flow(&cash_flow, Granularity::Annual);
        let (granularity, periods) = if too_thin(&annual) {
            tracing::info!("Annual reports for {} on Alpha Vantage are too thin, trying quarterly", ticker);
            pick_periods(annual, parse_cash_flow(&cash_flow, Granularity::Quarterly))
        } else {
            (Granularity::Annual, annual)
        };

        let market = if self.market_requires_history && too_thin(&periods) {
            tracing::info!("Skipping Alpha Vantage market data for {}: no usable cash-flow history", ticker);
            MarketSnapshot::default()
        } else {
            let overview = self.query("OVERVIEW", ticker).await?;
            let quote = self.query("GLOBAL_QUOTE", ticker).await?;
            parse_market(&overview, &quote)
        };

        Ok(FinancialStatements {
            ticker: ticker.clone(),
            provider: PROVIDER.to_string(),
            granularity,
            order: PeriodOrder::NewestFirst,
            periods,
            market,
        })
    }
}

/// Throttling and lookup errors arrive as HTTP 200 with a marker key.
pub fn check_body(body: &Value) -> Result<(), ValuationError> {
    for key in ["Note", "Information"] {
        if let Some(note) = body.get(key) {
            return Err(ValuationError::RateLimited(format!("Alpha Vantage: {}", note)));
        }
    }
    if let Some(error) = body.get("Error Message") {
        return Err(ValuationError::UpstreamMalformed(format!("Alpha Vantage error: {}", error)));
    }
    Ok(())
}

pub fn parse_cash_flow(body: &Value, granularity: Granularity) -> Vec<CashFlowPeriod> {
    let key = match granularity {
        Granularity::Annual => "annualReports",
        Granularity::Quarterly => "quarterlyReports",
    };
    body.get(key)
        .and_then(|r| r.as_array())
        .map(|reports| {
            reports
                .iter()
                .map(|report| ALPHA_VANTAGE_FIELDS.extract_period(report, report))
                .collect()
        })
        .unwrap_or_default()
}

pub fn parse_market(overview: &Value, quote: &Value) -> MarketSnapshot {
    MarketSnapshot {
        current_price: first_numeric_at(quote, PRICE_PATHS),
        shares_outstanding: first_numeric_at(overview, SHARES_PATHS),
        market_cap: first_numeric_at(overview, MARKET_CAP_PATHS),
        trailing_eps: first_numeric_at(overview, EPS_PATHS),
    }
}
