//! Bounded, TTL-checked cache of finished valuations.

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use valuation_core::{Clock, Ticker, ValuationResult};

pub const DEFAULT_CAPACITY: usize = 1024;
pub const DEFAULT_TTL_MINUTES: i64 = 15;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: ValuationResult,
    pub stored_at: DateTime<Utc>,
}

/// LRU map keyed by ticker. An entry is fresh while `now - stored_at < ttl`;
/// stale entries are dropped on read.
pub struct ResultCache {
    entries: Mutex<LruCache<Ticker, CacheEntry>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl ResultCache {
    pub fn new(capacity: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, ticker: &Ticker) -> Option<ValuationResult> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        let fresh = match entries.get(ticker) {
            Some(entry) if now - entry.stored_at < self.ttl => Some(entry.value.clone()),
            Some(_) => None,
            None => return None,
        };

        if fresh.is_none() {
            tracing::debug!("Cache entry for {} expired", ticker);
            entries.pop(ticker);
        }
        fresh
    }

    pub async fn put(&self, ticker: Ticker, value: ValuationResult) {
        let entry = CacheEntry {
            value,
            stored_at: self.clock.now(),
        };
        if let Some((evicted, _)) = self.entries.lock().await.push(ticker.clone(), entry) {
            if evicted != ticker {
                tracing::debug!("Evicted least recently used entry {}", evicted);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Drop every expired entry, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let expired: Vec<Ticker> = entries
            .iter()
            .filter(|(_, entry)| now - entry.stored_at >= self.ttl)
            .map(|(ticker, _)| ticker.clone())
            .collect();
        for ticker in &expired {
            entries.pop(ticker);
        }
        expired.len()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: StdMutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: StdMutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use valuation_core::{AnalysisStatus, SignalPolicy, ValuationMode, ValuationSignal};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn result(symbol: &str) -> ValuationResult {
        ValuationResult {
            ticker: Ticker::parse(symbol).unwrap(),
            current_price: 100.0,
            intrinsic_value_per_share: Some(120.0),
            present_value: 1_200.0,
            valuation_status: ValuationSignal::Undervalued,
            valuation_mode: ValuationMode::FcfHistory,
            signal_policy: SignalPolicy::three_way(0.10),
            risk_score: 12,
            years_used: 3,
            status: AnalysisStatus::Complete,
            analyzed_at: start(),
        }
    }

    fn cache(capacity: usize) -> (ResultCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let cache = ResultCache::new(capacity, Duration::minutes(15), clock.clone());
        (cache, clock)
    }

    #[tokio::test]
    async fn test_hit_within_ttl() {
        let (cache, clock) = cache(8);
        let aapl = Ticker::parse("AAPL").unwrap();
        cache.put(aapl.clone(), result("AAPL")).await;

        clock.advance(Duration::minutes(15) - Duration::seconds(1));
        assert_eq!(cache.get(&aapl).await, Some(result("AAPL")));
    }

    #[tokio::test]
    async fn test_expired_entry_removed_on_read() {
        let (cache, clock) = cache(8);
        let aapl = Ticker::parse("AAPL").unwrap();
        cache.put(aapl.clone(), result("AAPL")).await;

        clock.advance(Duration::minutes(15));
        assert_eq!(cache.get(&aapl).await, None);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_put_refreshes_timestamp() {
        let (cache, clock) = cache(8);
        let msft = Ticker::parse("MSFT").unwrap();
        cache.put(msft.clone(), result("MSFT")).await;
        clock.advance(Duration::minutes(10));
        cache.put(msft.clone(), result("MSFT")).await;
        clock.advance(Duration::minutes(10));

        assert!(cache.get(&msft).await.is_some());
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let (cache, _clock) = cache(2);
        let a = Ticker::parse("A").unwrap();
        let b = Ticker::parse("B").unwrap();
        let c = Ticker::parse("C").unwrap();

        cache.put(a.clone(), result("A")).await;
        cache.put(b.clone(), result("B")).await;
        assert!(cache.get(&a).await.is_some());
        cache.put(c.clone(), result("C")).await;

        assert_eq!(cache.len().await, 2);
        assert!(cache.get(&b).await.is_none());
        assert!(cache.get(&a).await.is_some());
        assert!(cache.get(&c).await.is_some());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (cache, clock) = cache(8);
        cache.put(Ticker::parse("OLD").unwrap(), result("OLD")).await;
        clock.advance(Duration::minutes(20));
        cache.put(Ticker::parse("NEW").unwrap(), result("NEW")).await;

        assert_eq!(cache.purge_expired().await, 1);
        assert_eq!(cache.len().await, 1);
    }
}
