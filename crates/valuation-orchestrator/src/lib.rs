use dashmap::DashMap;
use dcf_engine::{
    classify, valuation_gap, DcfValuation, DcfValuator, EpsProxyValuator, FcfSeriesBuilder,
    RiskScorer, RiskSignals,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use valuation_core::{
    stats, AnalysisStatus, Clock, FinancialDataProvider, FinancialStatements, SystemClock, Ticker,
    ValuationError, ValuationMode, ValuationResult,
};

pub mod cache;
pub mod config;

pub use cache::{CacheEntry, ManualClock, ResultCache};
pub use config::AnalyzerConfig;

type InFlightMap = DashMap<Ticker, Arc<Mutex<()>>>;

/// A request's claim on its ticker's in-flight lock. Dropping the slot,
/// including when the request future is cancelled, removes the map entry
/// once no other request holds it.
struct InFlightSlot<'a> {
    map: &'a InFlightMap,
    ticker: &'a Ticker,
    lock: Option<Arc<Mutex<()>>>,
}

impl<'a> InFlightSlot<'a> {
    fn claim(map: &'a InFlightMap, ticker: &'a Ticker) -> Self {
        let lock = map.entry(ticker.clone()).or_default().clone();
        Self {
            map,
            ticker,
            lock: Some(lock),
        }
    }

    fn mutex(&self) -> Result<&Mutex<()>, ValuationError> {
        self.lock.as_deref().ok_or_else(|| {
            ValuationError::Internal(format!("in-flight lock for {} already released", self.ticker))
        })
    }
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        // Release our handle first so the count check sees only the map's.
        drop(self.lock.take());
        self.map
            .remove_if(self.ticker, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Ticker in, cached or freshly computed valuation out.
///
/// Concurrent misses for the same ticker wait on one per-ticker lock, so the
/// provider sees at most one in-flight fetch per ticker.
pub struct ValuationOrchestrator {
    provider: Arc<dyn FinancialDataProvider>,
    config: AnalyzerConfig,
    cache: ResultCache,
    in_flight: InFlightMap,
    builder: FcfSeriesBuilder,
    scorer: Box<dyn RiskScorer>,
    clock: Arc<dyn Clock>,
}

impl ValuationOrchestrator {
    pub fn new(
        provider: Arc<dyn FinancialDataProvider>,
        config: AnalyzerConfig,
    ) -> Result<Self, ValuationError> {
        Self::with_clock(provider, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        provider: Arc<dyn FinancialDataProvider>,
        config: AnalyzerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ValuationError> {
        config.validate()?;
        tracing::info!(
            "Valuation orchestrator using {} provider ({:?} mode, {} risk, cache ttl {}m)",
            provider.name(),
            config.mode,
            config.risk_policy.as_str(),
            config.cache_ttl.num_minutes()
        );

        Ok(Self {
            provider,
            cache: ResultCache::new(config.cache_capacity, config.cache_ttl, clock.clone()),
            in_flight: DashMap::new(),
            builder: FcfSeriesBuilder::new(config.min_periods, config.max_lookback),
            scorer: config.risk_policy.scorer(),
            config,
            clock,
        })
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Validate the ticker, serve a fresh cache entry if one exists, otherwise
    /// fetch, value and cache. Failures are returned and never cached.
    pub async fn analyze(&self, raw_ticker: Option<&str>) -> Result<ValuationResult, ValuationError> {
        let ticker = Ticker::parse(raw_ticker.unwrap_or_default())?;

        if let Some(hit) = self.cache.get(&ticker).await {
            tracing::debug!("Cache hit for {}", ticker);
            return Ok(hit.with_status(AnalysisStatus::Cached));
        }

        let slot = InFlightSlot::claim(&self.in_flight, &ticker);
        let outcome = match slot.mutex() {
            Ok(lock) => self.analyze_exclusive(&ticker, lock).await,
            Err(e) => Err(e),
        };
        drop(slot);

        if let Err(e) = &outcome {
            if e.is_expected() {
                tracing::warn!("Valuation for {} failed: {}", ticker, e);
            } else {
                tracing::error!("Valuation for {} failed unexpectedly: {}", ticker, e);
            }
        }
        outcome
    }

    async fn analyze_exclusive(
        &self,
        ticker: &Ticker,
        lock: &Mutex<()>,
    ) -> Result<ValuationResult, ValuationError> {
        let _guard = lock.lock().await;

        // Another request may have filled the cache while we waited.
        if let Some(hit) = self.cache.get(ticker).await {
            tracing::debug!("Cache hit for {} after waiting on in-flight fetch", ticker);
            return Ok(hit.with_status(AnalysisStatus::Cached));
        }
        tracing::debug!("Cache miss for {}", ticker);

        let result = self.evaluate(ticker).await?;
        self.cache.put(ticker.clone(), result.clone()).await;
        Ok(result)
    }

    async fn evaluate(&self, ticker: &Ticker) -> Result<ValuationResult, ValuationError> {
        tracing::info!("Starting DCF valuation for {} via {}", ticker, self.provider.name());
        let statements = self.provider.fetch_financials(ticker).await?;
        let market = &statements.market;

        // Thin history is reported ahead of missing quotes; adapters skip the
        // market lookups for such tickers.
        let (valuation, series) = self.valuate(&statements)?;

        let current_price = market
            .current_price
            .filter(|p| *p > 0.0 && p.is_finite())
            .ok_or_else(|| {
                ValuationError::DataIncomplete(format!("current price unavailable for {}", ticker))
            })?;

        let (intrinsic, reference) = match valuation.intrinsic_price_per_share {
            Some(per_share) => (per_share, current_price),
            None => {
                let market_cap = market.market_cap.filter(|c| *c > 0.0).ok_or_else(|| {
                    ValuationError::DataIncomplete(format!(
                        "neither shares outstanding nor market cap available for {}",
                        ticker
                    ))
                })?;
                (valuation.present_value, market_cap)
            }
        };

        let signal = classify(self.config.signal_policy, intrinsic, reference);
        let gap = valuation_gap(intrinsic, reference);
        let signals = self.risk_signals(ticker, gap).await;
        let risk_score = self.scorer.score(&series, &signals);

        tracing::info!(
            "{}: intrinsic {:.2} vs reference {:.2} -> {} (risk {})",
            ticker,
            intrinsic,
            reference,
            signal.to_label(),
            risk_score
        );

        Ok(ValuationResult {
            ticker: ticker.clone(),
            current_price,
            intrinsic_value_per_share: valuation.intrinsic_price_per_share,
            present_value: valuation.present_value,
            valuation_status: signal,
            valuation_mode: self.config.mode,
            signal_policy: self.config.signal_policy,
            risk_score,
            years_used: valuation.years_used,
            status: AnalysisStatus::Complete,
            analyzed_at: self.clock.now(),
        })
    }

    fn valuate(
        &self,
        statements: &FinancialStatements,
    ) -> Result<(DcfValuation, Vec<f64>), ValuationError> {
        let shares = statements.market.shares_outstanding;
        match self.config.mode {
            ValuationMode::FcfHistory => {
                let series = self.builder.build(statements)?;
                let valuation = DcfValuator::new(self.config.assumptions).valuate(&series, shares)?;
                Ok((valuation, series.values().to_vec()))
            }
            ValuationMode::EpsProxy => {
                let eps = statements.market.trailing_eps.ok_or_else(|| {
                    ValuationError::DataIncomplete(format!(
                        "trailing EPS unavailable for {}",
                        statements.ticker
                    ))
                })?;
                let valuation = EpsProxyValuator::new(self.config.eps_proxy).valuate(eps, shares)?;
                Ok((valuation, Vec::new()))
            }
        }
    }

    async fn risk_signals(&self, ticker: &Ticker, gap: f64) -> RiskSignals {
        let mut signals = RiskSignals {
            valuation_gap: gap,
            ..Default::default()
        };
        if !self.config.risk_policy.needs_price_history() {
            return signals;
        }

        match self
            .provider
            .fetch_price_history(ticker, self.config.price_history_days)
            .await
        {
            Ok(points) => {
                let closes: Vec<f64> = points.iter().map(|p| p.close).collect();
                signals.volatility = stats::annualized_volatility(&closes);
                signals.drawdown = stats::drawdown_from_peak(&closes);
            }
            Err(e) => {
                tracing::warn!("Price history for {} unavailable, scoring without it: {}", ticker, e);
            }
        }
        signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use dcf_engine::RiskPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use valuation_core::{
        CashFlowPeriod, Granularity, MarketSnapshot, PeriodOrder, PricePoint, SignalPolicy,
        ValuationSignal,
    };

    struct MockProvider {
        fcf: Vec<f64>,
        market: MarketSnapshot,
        closes: Vec<f64>,
        delay_ms: u64,
        financial_calls: AtomicUsize,
        history_calls: AtomicUsize,
    }

    impl MockProvider {
        fn new(fcf: &[f64], market: MarketSnapshot) -> Self {
            Self {
                fcf: fcf.to_vec(),
                market,
                closes: Vec::new(),
                delay_ms: 0,
                financial_calls: AtomicUsize::new(0),
                history_calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.financial_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FinancialDataProvider for MockProvider {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn fetch_financials(&self, ticker: &Ticker) -> Result<FinancialStatements, ValuationError> {
            self.financial_calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            Ok(FinancialStatements {
                ticker: ticker.clone(),
                provider: "mock".to_string(),
                granularity: Granularity::Annual,
                order: PeriodOrder::OldestFirst,
                periods: self
                    .fcf
                    .iter()
                    .map(|v| CashFlowPeriod {
                        free_cash_flow: Some(*v),
                        ..Default::default()
                    })
                    .collect(),
                market: self.market.clone(),
            })
        }

        async fn fetch_price_history(
            &self,
            _ticker: &Ticker,
            _days: u32,
        ) -> Result<Vec<PricePoint>, ValuationError> {
            self.history_calls.fetch_add(1, Ordering::SeqCst);
            let start = Utc.with_ymd_and_hms(2024, 1, 2, 21, 0, 0).unwrap();
            Ok(self
                .closes
                .iter()
                .enumerate()
                .map(|(i, close)| PricePoint {
                    timestamp: start + Duration::days(i as i64),
                    close: *close,
                })
                .collect())
        }
    }

    fn market(price: f64, shares: Option<f64>) -> MarketSnapshot {
        MarketSnapshot {
            current_price: Some(price),
            shares_outstanding: shares,
            ..Default::default()
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 3, 14, 30, 0).unwrap()))
    }

    fn orchestrator(
        provider: Arc<MockProvider>,
        config: AnalyzerConfig,
        clock: Arc<ManualClock>,
    ) -> ValuationOrchestrator {
        ValuationOrchestrator::with_clock(provider, config, clock).unwrap()
    }

    #[tokio::test]
    async fn test_second_call_within_ttl_is_cached() {
        let provider = Arc::new(MockProvider::new(&[100.0, 110.0, 121.0], market(100.0, Some(10.0))));
        let clock = clock();
        let orch = orchestrator(provider.clone(), AnalyzerConfig::default(), clock.clone());

        let first = orch.analyze(Some("aapl")).await.unwrap();
        clock.advance(Duration::minutes(5));
        let second = orch.analyze(Some("AAPL")).await.unwrap();

        assert_eq!(provider.calls(), 1);
        assert_eq!(first.status, AnalysisStatus::Complete);
        assert_eq!(second.status, AnalysisStatus::Cached);
        assert_eq!(second.with_status(AnalysisStatus::Complete), first);
    }

    #[tokio::test]
    async fn test_expired_entry_refetches() {
        let provider = Arc::new(MockProvider::new(&[100.0, 110.0, 121.0], market(100.0, Some(10.0))));
        let clock = clock();
        let orch = orchestrator(provider.clone(), AnalyzerConfig::default(), clock.clone());

        orch.analyze(Some("AAPL")).await.unwrap();
        clock.advance(Duration::minutes(15));
        let again = orch.analyze(Some("AAPL")).await.unwrap();

        assert_eq!(provider.calls(), 2);
        assert_eq!(again.status, AnalysisStatus::Complete);
    }

    #[tokio::test]
    async fn test_fcf_valuation_fields() {
        let provider = Arc::new(MockProvider::new(&[100.0, 110.0, 121.0], market(100.0, Some(10.0))));
        let orch = orchestrator(provider, AnalyzerConfig::default(), clock());

        let result = orch.analyze(Some("AAPL")).await.unwrap();
        let per_share = result.intrinsic_value_per_share.unwrap();
        assert!((per_share - result.present_value / 10.0).abs() < 1e-9);
        assert_eq!(result.valuation_status, ValuationSignal::Undervalued);
        assert_eq!(result.valuation_mode, ValuationMode::FcfHistory);
        assert_eq!(result.signal_policy, SignalPolicy::three_way(0.10));
        assert_eq!(result.years_used, 3);
        assert_eq!(result.risk_score, 6);
    }

    #[tokio::test]
    async fn test_missing_ticker_never_reaches_provider() {
        let provider = Arc::new(MockProvider::new(&[1.0, 2.0], market(10.0, None)));
        let orch = orchestrator(provider.clone(), AnalyzerConfig::default(), clock());

        assert!(matches!(orch.analyze(None).await, Err(ValuationError::InvalidTicker(_))));
        assert!(matches!(orch.analyze(Some("   ")).await, Err(ValuationError::InvalidTicker(_))));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let provider = Arc::new(MockProvider::new(&[42.0], market(10.0, Some(1.0))));
        let orch = orchestrator(provider.clone(), AnalyzerConfig::default(), clock());

        for _ in 0..2 {
            assert!(matches!(
                orch.analyze(Some("THIN")).await,
                Err(ValuationError::InsufficientHistory { usable: 1, required: 2 })
            ));
        }
        assert_eq!(provider.calls(), 2);
        assert!(orch.cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_no_usable_periods_is_insufficient_history() {
        let provider = Arc::new(MockProvider::new(&[], MarketSnapshot::default()));
        let orch = orchestrator(provider, AnalyzerConfig::default(), clock());

        assert!(matches!(
            orch.analyze(Some("NEWCO")).await,
            Err(ValuationError::InsufficientHistory { usable: 0, required: 2 })
        ));
    }

    #[tokio::test]
    async fn test_missing_price_is_incomplete() {
        let provider = Arc::new(MockProvider::new(&[1.0, 2.0], MarketSnapshot::default()));
        let orch = orchestrator(provider, AnalyzerConfig::default(), clock());

        let err = orch.analyze(Some("NOPX")).await.unwrap_err();
        assert_eq!(err.status(), AnalysisStatus::Queued);
    }

    #[tokio::test]
    async fn test_market_cap_reference_without_shares() {
        let snapshot = MarketSnapshot {
            current_price: Some(50.0),
            market_cap: Some(1_000_000.0),
            ..Default::default()
        };
        let provider = Arc::new(MockProvider::new(&[100.0, 110.0, 121.0], snapshot));
        let orch = orchestrator(provider, AnalyzerConfig::default(), clock());

        let result = orch.analyze(Some("NOSH")).await.unwrap();
        assert!(result.intrinsic_value_per_share.is_none());
        assert_eq!(result.valuation_status, ValuationSignal::Overvalued);
    }

    #[tokio::test]
    async fn test_neither_shares_nor_market_cap() {
        let provider = Arc::new(MockProvider::new(&[100.0, 110.0], market(50.0, None)));
        let orch = orchestrator(provider, AnalyzerConfig::default(), clock());

        assert!(matches!(
            orch.analyze(Some("BARE")).await,
            Err(ValuationError::DataIncomplete(_))
        ));
    }

    #[tokio::test]
    async fn test_eps_proxy_mode() {
        let snapshot = MarketSnapshot {
            current_price: Some(100.0),
            trailing_eps: Some(6.0),
            ..Default::default()
        };
        let provider = Arc::new(MockProvider::new(&[], snapshot));
        let orch = orchestrator(provider, AnalyzerConfig::eps_proxy(), clock());

        let result = orch.analyze(Some("EPS")).await.unwrap();
        let fair = 6.0 * 1.08_f64.powi(5) * 15.0 / 1.10_f64.powi(5);
        assert!((result.intrinsic_value_per_share.unwrap() - fair).abs() < 1e-9);
        assert_eq!(result.years_used, 5);
        assert_eq!(result.valuation_mode, ValuationMode::EpsProxy);
        // fair ~= 82.1, below the 15% band around 100
        assert_eq!(result.valuation_status, ValuationSignal::Overvalued);
        assert_eq!(result.risk_score, ((100.0 - fair) / 100.0 * 100.0).trunc() as u8);
    }

    #[tokio::test]
    async fn test_weighted_policy_fetches_price_history() {
        let mut mock = MockProvider::new(&[100.0, 110.0, 121.0], market(100.0, Some(10.0)));
        mock.closes = vec![100.0, 120.0, 90.0, 96.0];
        let provider = Arc::new(mock);
        let config = AnalyzerConfig::default().with_risk_policy(RiskPolicy::Weighted);
        let orch = orchestrator(provider.clone(), config, clock());

        let result = orch.analyze(Some("VOL")).await.unwrap();
        assert_eq!(provider.history_calls.load(Ordering::SeqCst), 1);
        assert!(result.risk_score > 0);
        assert!(result.risk_score <= 100);
    }

    #[tokio::test]
    async fn test_dispersion_policy_skips_price_history() {
        let provider = Arc::new(MockProvider::new(&[100.0, 110.0], market(100.0, Some(10.0))));
        let orch = orchestrator(provider.clone(), AnalyzerConfig::default(), clock());

        orch.analyze(Some("CALM")).await.unwrap();
        assert_eq!(provider.history_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fetch() {
        let mut mock = MockProvider::new(&[100.0, 110.0, 121.0], market(100.0, Some(10.0)));
        mock.delay_ms = 50;
        let provider = Arc::new(mock);
        let orch = Arc::new(orchestrator(provider.clone(), AnalyzerConfig::default(), clock()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let orch = orch.clone();
                tokio::spawn(async move { orch.analyze(Some("BUSY")).await })
            })
            .collect();

        let mut complete = 0;
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            if result.status == AnalysisStatus::Complete {
                complete += 1;
            }
        }

        assert_eq!(provider.calls(), 1);
        assert_eq!(complete, 1);
        assert!(orch.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_request_releases_in_flight_entry() {
        let mut mock = MockProvider::new(&[100.0, 110.0, 121.0], market(100.0, Some(10.0)));
        mock.delay_ms = 200;
        let provider = Arc::new(mock);
        let orch = orchestrator(provider.clone(), AnalyzerConfig::default(), clock());

        let cancelled = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            orch.analyze(Some("SLOW")),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(provider.calls(), 1);
        assert!(orch.in_flight.is_empty());

        let result = orch.analyze(Some("SLOW")).await.unwrap();
        assert_eq!(result.status, AnalysisStatus::Complete);
        assert!(orch.in_flight.is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let provider = Arc::new(MockProvider::new(&[], MarketSnapshot::default()));
        let config = AnalyzerConfig::eps_proxy().with_risk_policy(RiskPolicy::CashFlowDispersion);
        assert!(ValuationOrchestrator::new(provider, config).is_err());
    }
}
