//! `POST /webhook-leads/{token}`: third-party lead deliveries.
//!
//! Accepted and duplicate deliveries both answer `200 {"success": true}`.
//! Unknown and disabled tokens both answer `404`, so a caller cannot discover
//! which tokens exist.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use tracing::error;

use crate::api::AppState;
use crate::error::IntakeError;

const IDEMPOTENCY_HEADER: &str = "idempotency-key";

pub fn routes() -> Router<AppState> {
    Router::new().route("/webhook-leads/{token}", post(receive_lead))
}

async fn receive_lead(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let hint = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok());

    match state.intake.ingest(&token, &body, hint, Utc::now()).await {
        Ok(_) => Json(serde_json::json!({ "success": true })).into_response(),
        Err(e) => intake_error_response(e),
    }
}

fn intake_error_response(err: IntakeError) -> Response {
    let (status, message) = match &err {
        IntakeError::Validation(m) => (StatusCode::BAD_REQUEST, m.clone()),
        IntakeError::Authentication => (StatusCode::NOT_FOUND, "unknown webhook".to_string()),
        IntakeError::Storage(e) => {
            error!(error = %e, "Webhook intake storage failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage unavailable, retry later".to_string(),
            )
        }
    };
    (
        status,
        Json(serde_json::json!({ "success": false, "error": message })),
    )
        .into_response()
}
