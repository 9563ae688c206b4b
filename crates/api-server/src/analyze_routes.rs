//! Valuation API routes.

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use valuation_core::{ValuationError, ValuationResult};

use crate::{AppError, AppState};

#[derive(Debug, Deserialize)]
pub struct AnalyzeQuery {
    #[serde(default)]
    pub ticker: Option<String>,
}

pub fn analyze_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(health))
        .route("/analyze", get(analyze))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": crate::SERVICE_NAME,
        "status": "ok",
        "provider": state.orchestrator.provider_name(),
    }))
}

async fn analyze(
    State(state): State<AppState>,
    query: Result<Query<AnalyzeQuery>, QueryRejection>,
) -> Result<Json<ValuationResult>, AppError> {
    let Query(query) = query.map_err(|rejection| {
        AppError::new(
            ValuationError::InvalidTicker(format!("Invalid query string: {}", rejection.body_text())),
            None,
        )
    })?;
    let raw = query.ticker.as_deref();
    let result = state
        .orchestrator
        .analyze(raw)
        .await
        .map_err(|e| AppError::new(e, raw))?;
    Ok(Json(result))
}
