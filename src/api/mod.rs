//! HTTP surface: webhook intake, CRM/settings REST, and the live-feed WebSocket.

pub mod admin;
pub mod feed;
pub mod webhook;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::automation::{RuleMatcher, RuleService};
use crate::config::IntakeConfig;
use crate::error::{DatabaseError, LeadError, RuleError};
use crate::events::EventBus;
use crate::intake::IntakeGateway;
use crate::leads::LeadService;
use crate::store::Database;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Database>,
    pub bus: Arc<EventBus>,
    pub intake: Arc<IntakeGateway>,
    pub leads: Arc<LeadService>,
    pub rules: Arc<RuleService>,
}

impl AppState {
    /// Wire the services over one store and bus.
    pub fn new(store: Arc<dyn Database>, bus: Arc<EventBus>, intake: IntakeConfig) -> Self {
        let matcher = Arc::new(RuleMatcher::new(store.clone()));
        Self {
            intake: Arc::new(IntakeGateway::new(
                store.clone(),
                matcher.clone(),
                bus.clone(),
                intake,
            )),
            leads: Arc::new(LeadService::new(store.clone(), matcher, bus.clone())),
            rules: Arc::new(RuleService::new(store.clone())),
            store,
            bus,
        }
    }
}

/// Build the full router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(webhook::routes())
        .merge(admin::routes())
        .merge(feed::routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "lead-relay"
    }))
}

// ── Errors ──────────────────────────────────────────────────────────

/// Error response for the REST handlers: `{"error": "..."}` with a status code.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Internal(m) => {
                error!(error = %m, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<LeadError> for ApiError {
    fn from(e: LeadError) -> Self {
        match e {
            LeadError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            LeadError::Conflict { .. } => ApiError::Conflict(e.to_string()),
            LeadError::Storage(e) => e.into(),
        }
    }
}

impl From<RuleError> for ApiError {
    fn from(e: RuleError) -> Self {
        match e {
            RuleError::Validation(_) => ApiError::BadRequest(e.to_string()),
            RuleError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            RuleError::Storage(e) => e.into(),
        }
    }
}
