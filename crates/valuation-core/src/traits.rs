use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{FinancialStatements, PricePoint, Ticker, ValuationError};

/// Upstream source of cash-flow statements and market data for a ticker.
///
/// Implementations isolate every provider quirk (endpoints, field names,
/// throttling signals) and hand back canonical records.
#[async_trait]
pub trait FinancialDataProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_financials(&self, ticker: &Ticker) -> Result<FinancialStatements, ValuationError>;

    /// Daily closes, oldest first. Providers without a price-history endpoint
    /// return an empty series.
    async fn fetch_price_history(
        &self,
        _ticker: &Ticker,
        _days: u32,
    ) -> Result<Vec<PricePoint>, ValuationError> {
        Ok(Vec::new())
    }
}

/// Time source, injectable so cache expiry can be tested deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
