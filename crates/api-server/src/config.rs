use anyhow::{bail, Context, Result};
use chrono::Duration as ChronoDuration;
use dcf_engine::RiskPolicy;
use market_data::{AlphaVantageProvider, PolygonProvider, YahooFinanceProvider};
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use valuation_core::{FinancialDataProvider, ValuationMode};
use valuation_orchestrator::AnalyzerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Yahoo,
    Polygon,
    AlphaVantage,
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "yahoo" | "yfinance" => Ok(ProviderKind::Yahoo),
            "polygon" => Ok(ProviderKind::Polygon),
            "alpha_vantage" | "alphavantage" => Ok(ProviderKind::AlphaVantage),
            other => bail!("unknown DATA_PROVIDER: {}", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub provider: ProviderKind,
    pub polygon_api_key: Option<String>,
    pub alpha_vantage_api_key: Option<String>,
    pub polygon_rate_limit: usize,
    pub upstream_timeout: Duration,
    pub cache_ttl_minutes: i64,
    pub cache_capacity: usize,
    pub valuation_mode: ValuationMode,
    /// Falls back to the mode's default policy when unset.
    pub risk_policy: Option<RiskPolicy>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_var("PORT", "10000")?,
            provider: parse_var("DATA_PROVIDER", "yahoo")?,
            polygon_api_key: non_empty_var("POLYGON_API_KEY"),
            alpha_vantage_api_key: non_empty_var("ALPHA_VANTAGE_API_KEY"),
            polygon_rate_limit: parse_var("POLYGON_RATE_LIMIT", "5")?,
            upstream_timeout: Duration::from_secs(parse_var("UPSTREAM_TIMEOUT_SECS", "10")?),
            cache_ttl_minutes: parse_var("CACHE_TTL_MINUTES", "15")?,
            cache_capacity: parse_var("CACHE_CAPACITY", "1024")?,
            valuation_mode: parse_var("VALUATION_MODE", "fcf_history")?,
            risk_policy: non_empty_var("RISK_POLICY")
                .map(|v| v.parse::<RiskPolicy>().map_err(anyhow::Error::msg))
                .transpose()
                .context("Invalid RISK_POLICY")?,
        };

        if config.cache_ttl_minutes <= 0 {
            bail!("CACHE_TTL_MINUTES must be positive");
        }
        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn analyzer_config(&self) -> AnalyzerConfig {
        let mut config = AnalyzerConfig::for_mode(self.valuation_mode);
        if let Some(policy) = self.risk_policy {
            config.risk_policy = policy;
        }
        config.cache_ttl = ChronoDuration::minutes(self.cache_ttl_minutes);
        config.cache_capacity = self.cache_capacity;
        config
    }

    pub fn build_provider(&self) -> Result<Arc<dyn FinancialDataProvider>> {
        // EPS proxy valuations need quotes even without cash-flow history.
        let market_requires_history = self.valuation_mode == ValuationMode::FcfHistory;
        let provider: Arc<dyn FinancialDataProvider> = match self.provider {
            ProviderKind::Yahoo => Arc::new(YahooFinanceProvider::new(self.upstream_timeout)),
            ProviderKind::Polygon => {
                let key = self
                    .polygon_api_key
                    .clone()
                    .context("POLYGON_API_KEY must be set when DATA_PROVIDER=polygon")?;
                Arc::new(
                    PolygonProvider::new(key, self.polygon_rate_limit, self.upstream_timeout)
                        .with_market_requires_history(market_requires_history),
                )
            }
            ProviderKind::AlphaVantage => {
                let key = self
                    .alpha_vantage_api_key
                    .clone()
                    .context("ALPHA_VANTAGE_API_KEY must be set when DATA_PROVIDER=alpha_vantage")?;
                Arc::new(
                    AlphaVantageProvider::new(key, self.upstream_timeout)
                        .with_market_requires_history(market_requires_history),
                )
            }
        };
        Ok(provider)
    }
}

fn parse_var<T>(name: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Into<anyhow::Error>,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse::<T>()
        .map_err(Into::<anyhow::Error>::into)
        .with_context(|| format!("Invalid {}", name))
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}
