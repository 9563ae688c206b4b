use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use valuation_core::ValuationError;

/// Sliding-window rate limiter: at most `max_requests` per `window` duration.
///
/// Callers wait for a free slot when one opens within `max_wait`; otherwise
/// `acquire` fails fast with `RateLimited` instead of parking the request.
#[derive(Clone)]
pub struct RateLimiter {
    timestamps: Arc<Mutex<VecDeque<Instant>>>,
    max_requests: usize,
    window: Duration,
    max_wait: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration, max_wait: Duration) -> Self {
        Self {
            timestamps: Arc::new(Mutex::new(VecDeque::new())),
            max_requests: max_requests.max(1),
            window,
            max_wait,
        }
    }

    pub fn per_minute(max_requests: usize, max_wait: Duration) -> Self {
        Self::new(max_requests, Duration::from_secs(60), max_wait)
    }

    pub async fn acquire(&self) -> Result<(), ValuationError> {
        loop {
            let mut ts = self.timestamps.lock().await;
            let now = Instant::now();

            // Remove timestamps outside the window
            while let Some(&front) = ts.front() {
                if now.duration_since(front) >= self.window {
                    ts.pop_front();
                } else {
                    break;
                }
            }

            let oldest = match ts.front() {
                Some(&oldest) if ts.len() >= self.max_requests => oldest,
                _ => {
                    ts.push_back(now);
                    return Ok(());
                }
            };

            let wait = (oldest + self.window).saturating_duration_since(now);
            if wait > self.max_wait {
                return Err(ValuationError::RateLimited(format!(
                    "request budget of {} per {:.0}s exhausted; retry in {:.1}s",
                    self.max_requests,
                    self.window.as_secs_f64(),
                    wait.as_secs_f64()
                )));
            }

            drop(ts);
            tracing::debug!("Rate limiter: waiting {:.2}s for upstream slot", wait.as_secs_f64());
            tokio::time::sleep(wait + Duration::from_millis(5)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fails_fast_when_budget_exhausted() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60), Duration::ZERO);
        assert!(limiter.acquire().await.is_ok());
        assert!(limiter.acquire().await.is_ok());
        assert!(matches!(
            limiter.acquire().await,
            Err(ValuationError::RateLimited(_))
        ));
    }

    #[tokio::test]
    async fn test_waits_for_slot_within_max_wait() {
        let limiter = RateLimiter::new(1, Duration::from_millis(40), Duration::from_secs(1));
        let start = std::time::Instant::now();
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_zero_budget_is_treated_as_one() {
        let limiter = RateLimiter::new(0, Duration::from_secs(60), Duration::ZERO);
        assert!(limiter.acquire().await.is_ok());
        assert!(limiter.acquire().await.is_err());
    }
}
