use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use valuation_core::{
    CashFlowPeriod, FinancialDataProvider, FinancialStatements, Granularity, MarketSnapshot,
    PeriodOrder, PricePoint, Ticker, ValuationError,
};

use crate::fields::{first_numeric_at, numeric_value, FieldPath, FieldSynonyms};
use crate::{build_http_client, pick_periods, send_json, too_thin, RateLimiter};

const BASE_URL: &str = "https://api.polygon.io";
const PROVIDER: &str = "polygon";
const PERIOD_LIMIT: &str = "5";

pub const POLYGON_FIELDS: FieldSynonyms = FieldSynonyms {
    operating_cash_flow: &[
        "net_cash_flow_from_operating_activities",
        "net_cash_flow_from_operating_activities_continuing",
    ],
    capital_expenditure: &[
        "capital_expenditure",
        "payments_to_acquire_property_plant_and_equipment",
    ],
    free_cash_flow: &["free_cash_flow"],
    period_end: &["end_date", "filing_date"],
};

/// Stand-in for capex when Polygon reports no dedicated line. Only a net
/// investing outflow is accepted; an inflow says nothing about capex.
const INVESTING_CASH_FLOW: &str = "net_cash_flow_from_investing_activities";

const SHARES_PATHS: &[FieldPath] = &[
    &["results", "weighted_shares_outstanding"],
    &["results", "share_class_shares_outstanding"],
];
const MARKET_CAP_PATHS: &[FieldPath] = &[&["results", "market_cap"]];
const PRICE_PATHS: &[FieldPath] = &[
    &["ticker", "lastTrade", "p"],
    &["ticker", "day", "c"],
    &["ticker", "prevDay", "c"],
];

#[derive(Clone)]
pub struct PolygonProvider {
    api_key: String,
    client: Client,
    base_url: String,
    rate_limiter: RateLimiter,
    timeout: Duration,
    market_requires_history: bool,
}

impl PolygonProvider {
    /// `rate_limit` is requests per minute (5 on the free tier, 500 on Starter).
    pub fn new(api_key: String, rate_limit: usize, timeout: Duration) -> Self {
        Self {
            api_key,
            client: build_http_client(timeout),
            base_url: BASE_URL.to_string(),
            rate_limiter: RateLimiter::per_minute(rate_limit, Duration::from_secs(5)),
            timeout,
            market_requires_history: true,
        }
    }

    /// When set (the default), ticker details and snapshot are skipped for
    /// tickers without enough cash-flow history to value.
    pub fn with_market_requires_history(mut self, required: bool) -> Self {
        self.market_requires_history = required;
        self
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
            .query(&[("apiKey", self.api_key.as_str())])
            .query(query);
        send_json(PROVIDER, builder, self.timeout).await
    }

    async fn fetch_cash_flows(
        &self,
        ticker: &Ticker,
        granularity: Granularity,
    ) -> Result<Vec<CashFlowPeriod>, ValuationError> {
        let body = self
            .get(
                "/vX/reference/financials",
                &[
                    ("ticker", ticker.as_str()),
                    ("timeframe", granularity.as_str()),
                    ("limit", PERIOD_LIMIT),
                    ("order", "desc"),
                    ("sort", "period_of_report_date"),
                ],
            )
            .await?;
        parse_financials(&body)
    }

    async fn fetch_market(&self, ticker: &Ticker) -> Result<MarketSnapshot, ValuationError> {
        let mut market = MarketSnapshot::default();

        match self
            .get(&format!("/v3/reference/tickers/{}", ticker), &[])
            .await
        {
            Ok(details) => {
                market.shares_outstanding = first_numeric_at(&details, SHARES_PATHS);
                market.market_cap = first_numeric_at(&details, MARKET_CAP_PATHS);
            }
            Err(e @ ValuationError::RateLimited(_)) => return Err(e),
            Err(e) => tracing::warn!("Polygon ticker details unavailable for {}: {}", ticker, e),
        }

        match self
            .get(
                &format!("/v2/snapshot/locale/us/markets/stocks/tickers/{}", ticker),
                &[],
            )
            .await
        {
            Ok(snapshot) => market.current_price = parse_snapshot_price(&snapshot),
            Err(e @ ValuationError::RateLimited(_)) => return Err(e),
            Err(e) => tracing::warn!("Polygon snapshot unavailable for {}: {}", ticker, e),
        }

        Ok(market)
    }
}

#[async_trait]
impl FinancialDataProvider for PolygonProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn fetch_financials(&self, ticker: &Ticker) -> Result<FinancialStatements, ValuationError> {
        let annual = self.fetch_cash_flows(ticker, Granularity::Annual).await?;
        let (granularity, periods) = if too_thin(&annual) {
            tracing::info!("Annual financials for {} on Polygon are too thin, trying quarterly", ticker);
            let quarterly = self.fetch_cash_flows(ticker, Granularity::Quarterly).await?;
            pick_periods(annual, quarterly)
        } else {
            (Granularity::Annual, annual)
        };

        let market = if self.market_requires_history && too_thin(&periods) {
            tracing::info!("Skipping Polygon market data for {}: no usable cash-flow history", ticker);
            MarketSnapshot::default()
        } else {
            self.fetch_market(ticker).await?
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

    async fn fetch_price_history(
        &self,
        ticker: &Ticker,
        days: u32,
    ) -> Result<Vec<PricePoint>, ValuationError> {
        let to = Utc::now();
        let from = to - ChronoDuration::days(i64::from(days));
        let body = self
            .get(
                &format!(
                    "/v2/aggs/ticker/{}/range/1/day/{}/{}",
                    ticker,
                    from.format("%Y-%m-%d"),
                    to.format("%Y-%m-%d")
                ),
                &[("adjusted", "true"), ("sort", "asc")],
            )
            .await?;
        Ok(parse_aggregates(&body))
    }
}

/// `results` must be an array; each entry holds its statement under
/// `financials.cash_flow_statement`.
pub fn parse_financials(body: &Value) -> Result<Vec<CashFlowPeriod>, ValuationError> {
    let results = body
        .get("results")
        .and_then(|r| r.as_array())
        .ok_or_else(|| {
            ValuationError::UpstreamMalformed("polygon financials missing results".to_string())
        })?;

    Ok(results
        .iter()
        .map(|result| {
            let cash_flow = result
                .get("financials")
                .and_then(|f| f.get("cash_flow_statement"))
                .unwrap_or(&Value::Null);
            let mut period = POLYGON_FIELDS.extract_period(result, cash_flow);
            if period.capital_expenditure.is_none() {
                period.capital_expenditure = cash_flow
                    .get(INVESTING_CASH_FLOW)
                    .and_then(numeric_value)
                    .filter(|v| *v < 0.0);
            }
            period
        })
        .collect())
}

/// Last trade, then today's close, then the previous close. Zero prices
/// (pre-market snapshots) are skipped.
pub fn parse_snapshot_price(body: &Value) -> Option<f64> {
    PRICE_PATHS.iter().find_map(|path| {
        first_numeric_at(body, &[*path]).filter(|price| *price > 0.0)
    })
}

pub fn parse_aggregates(body: &Value) -> Vec<PricePoint> {
    body.get("results")
        .and_then(|r| r.as_array())
        .map(|bars| {
            bars.iter()
                .filter_map(|bar| {
                    let close = bar.get("c").and_then(numeric_value)?;
                    let timestamp = bar
                        .get("t")
                        .and_then(|t| t.as_i64())
                        .and_then(DateTime::from_timestamp_millis)?;
                    Some(PricePoint { timestamp, close })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    #[test]
    fn test_parse_financials() {
        let body = json!({
            "results": [
                {
                    "end_date": "2023-12-31",
                    "fiscal_period": "FY",
                    "financials": {
                        "cash_flow_statement": {
                            "net_cash_flow_from_operating_activities": { "value": 1200.0 },
                            "net_cash_flow_from_investing_activities": { "value": -300.0 }
                        }
                    }
                },
                {
                    "end_date": "2022-12-31",
                    "financials": {
                        "cash_flow_statement": {
                            "net_cash_flow_from_operating_activities_continuing": { "value": 1000.0 },
                            "payments_to_acquire_property_plant_and_equipment": { "value": 250.0 },
                            "net_cash_flow_from_investing_activities": { "value": -900.0 }
                        }
                    }
                },
                {
                    "end_date": "2021-12-31",
                    "financials": {
                        "cash_flow_statement": {
                            "net_cash_flow_from_operating_activities": { "value": 800.0 },
                            "net_cash_flow_from_investing_activities": { "value": 450.0 }
                        }
                    }
                },
                { "end_date": "2020-12-31", "financials": {} }
            ]
        });

        let periods = parse_financials(&body).unwrap();
        assert_eq!(periods.len(), 4);
        assert_eq!(periods[0].period_end, NaiveDate::from_ymd_opt(2023, 12, 31));
        assert_eq!(periods[0].derived_fcf(), Some(900.0));
        // Dedicated capex line beats investing cash flow
        assert_eq!(periods[1].capital_expenditure, Some(250.0));
        assert_eq!(periods[1].derived_fcf(), Some(750.0));
        // A net investing inflow (asset sales) is not capex
        assert_eq!(periods[2].capital_expenditure, None);
        assert_eq!(periods[2].derived_fcf(), None);
        assert_eq!(periods[3].derived_fcf(), None);
    }

    #[test]
    fn test_parse_financials_rejects_missing_results() {
        let body = json!({ "status": "ERROR" });
        assert!(matches!(
            parse_financials(&body),
            Err(ValuationError::UpstreamMalformed(_))
        ));
    }

    #[test]
    fn test_parse_snapshot_price_fallbacks() {
        let with_trade = json!({ "ticker": { "lastTrade": { "p": 101.5 }, "day": { "c": 100.0 } } });
        assert_eq!(parse_snapshot_price(&with_trade), Some(101.5));

        let premarket = json!({ "ticker": { "day": { "c": 0.0 }, "prevDay": { "c": 98.2 } } });
        assert_eq!(parse_snapshot_price(&premarket), Some(98.2));

        assert_eq!(parse_snapshot_price(&json!({})), None);
    }

    #[test]
    fn test_parse_aggregates() {
        let body = json!({
            "results": [
                { "t": 1_700_000_000_000_i64, "c": 10.0 },
                { "t": 1_700_086_400_000_i64, "c": 11.0 },
                { "t": 1_700_172_800_000_i64 }
            ]
        });
        let bars = parse_aggregates(&body);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].close, 11.0);
    }
}
