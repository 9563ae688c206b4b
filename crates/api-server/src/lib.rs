use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};
use valuation_core::{Ticker, ValuationError};
use valuation_orchestrator::ValuationOrchestrator;

pub mod analyze_routes;
pub mod config;
pub mod request_id;

pub use config::{ProviderKind, ServerConfig};

pub const SERVICE_NAME: &str = "intrinsiq";

const DEFAULT_LOG_FILTER: &str = "api_server=info,valuation_orchestrator=info,market_data=info";
const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ValuationOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<ValuationOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

/// JSON body for every non-200 response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
}

/// A failed analysis, rendered with the status code its category maps to.
#[derive(Debug)]
pub struct AppError {
    error: ValuationError,
    ticker: Option<String>,
}

impl AppError {
    /// Only a ticker that passes validation is echoed back to the caller.
    pub fn new(error: ValuationError, raw_ticker: Option<&str>) -> Self {
        let ticker = raw_ticker
            .and_then(|t| Ticker::parse(t).ok())
            .map(|t| t.to_string());
        Self { error, ticker }
    }

    pub fn status_code(&self) -> StatusCode {
        match &self.error {
            ValuationError::InvalidTicker(_)
            | ValuationError::InsufficientHistory { .. }
            | ValuationError::InvalidAssumptions(_) => StatusCode::BAD_REQUEST,
            ValuationError::UpstreamMalformed(_) => StatusCode::NOT_FOUND,
            ValuationError::UpstreamUnavailable(_) | ValuationError::DataIncomplete(_) => {
                StatusCode::ACCEPTED
            }
            ValuationError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ValuationError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ValuationError> for AppError {
    fn from(error: ValuationError) -> Self {
        Self { error, ticker: None }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self.error {
            ValuationError::InvalidTicker(msg) => msg.clone(),
            ValuationError::Internal(detail) => {
                tracing::error!("Internal error: {}", detail);
                INTERNAL_ERROR_MESSAGE.to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorBody {
            status: self.error.status().as_str(),
            error: message,
            ticker: self.ticker,
        };
        (status, Json(body)).into_response()
    }
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic payload".to_string()
    };
    tracing::error!("Handler panicked: {}", detail);

    let body = ErrorBody {
        status: "error",
        error: INTERNAL_ERROR_MESSAGE.to_string(),
        ticker: None,
    };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

pub fn build_router(state: AppState) -> Router {
    analyze_routes::analyze_routes()
        .with_state(state)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(middleware::from_fn(request_id::request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = tracing::field::Empty,
                )
            }),
        )
        .layer(CorsLayer::permissive())
}

pub fn init_tracing() {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER))
    };
    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    // An already-installed subscriber wins.
    if json_logging {
        let _ = tracing_subscriber::fmt().json().with_env_filter(filter()).try_init();
    } else {
        let _ = tracing_subscriber::fmt().with_env_filter(filter()).try_init();
    }
}

pub async fn run_server() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = ServerConfig::from_env()?;
    let provider = config.build_provider()?;
    let orchestrator = Arc::new(ValuationOrchestrator::new(provider, config.analyzer_config())?);

    spawn_cache_purge(orchestrator.clone());

    let app = build_router(AppState::new(orchestrator));
    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("{} listening on http://{}", SERVICE_NAME, addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Sweeps stale entries once per TTL so idle tickers do not pin memory.
fn spawn_cache_purge(orchestrator: Arc<ValuationOrchestrator>) {
    let period = orchestrator
        .cache()
        .ttl()
        .to_std()
        .unwrap_or(std::time::Duration::from_secs(900));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let purged = orchestrator.cache().purge_expired().await;
            if purged > 0 {
                tracing::debug!("Purged {} expired valuations", purged);
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
