//! Axum JSON API over the unified store and insight queries.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tracing::error;
use unify_core::EntityType;
use unify_pipeline::{enrich_transactions, PipelineConfig};
use unify_storage::{PgRepository, Repository};

pub const CRATE_NAME: &str = "unify-web";

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repository>,
}

impl AppState {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/", get(overview_handler))
        .route("/api/data/{entity_type}", get(data_by_type_handler))
        .route("/api/insights/users", get(user_insights_handler))
        .route("/api/insights/products", get(product_insights_handler))
        .route("/api/enrich/transactions", post(enrich_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("UNIFY_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = PipelineConfig::from_env();
    let repo = PgRepository::connect(&config.database_url).await?;
    repo.migrate().await?;

    let state = AppState::new(Arc::new(repo));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn overview_handler() -> Response {
    Json(json!({
        "message": "Welcome to the Unify API",
        "endpoints": {
            "/api/data/{entity_type}/": "Retrieve processed data by type",
            "/api/insights/users/": "Retrieve user spending insights",
            "/api/insights/products/": "Retrieve product popularity metrics",
            "/api/enrich/transactions/": "Trigger transaction data enrichment",
        }
    }))
    .into_response()
}

async fn data_by_type_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(entity_type): AxumPath<String>,
) -> Response {
    let Ok(entity_type) = EntityType::from_str(&entity_type) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Invalid entity_type. Allowed types: 'product', 'user', 'transaction'."
            })),
        )
            .into_response();
    };

    match state.repo.list_unified(entity_type).await {
        Ok(records) => Json(records).into_response(),
        Err(err) => {
            error!(entity_type = %entity_type, error = %err, "retrieving unified data failed");
            server_error("An error occurred while processing your request.")
        }
    }
}

async fn user_insights_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.repo.user_spending().await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => {
            error!(error = %err, "computing user insights failed");
            server_error("An error occurred while computing user insights.")
        }
    }
}

async fn product_insights_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.repo.product_insights().await {
        Ok(insights) => Json(insights).into_response(),
        Err(err) => {
            error!(error = %err, "computing product insights failed");
            server_error("An error occurred while computing product insights.")
        }
    }
}

async fn enrich_handler(State(state): State<Arc<AppState>>) -> Response {
    match enrich_transactions(state.repo.as_ref()).await {
        Ok(count) => Json(json!({
            "message": format!("Successfully enriched {count} transaction records.")
        }))
        .into_response(),
        Err(err) => {
            error!(error = %err, "transaction enrichment failed");
            server_error("An error occurred during the transaction enrichment process.")
        }
    }
}

/// Generic failure body; the detail stays in the logs.
fn server_error(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": message})),
    )
        .into_response()
}
