//! REST endpoints for tenant settings, the CRM leads table, automation rules,
//! and firing history.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::api::{ApiError, AppState};
use crate::automation::{FiringStatus, RuleDraft};
use crate::leads::{LeadFilter, LeadStatus, LeadUpdate};
use crate::tenants::{Tenant, TenantProfile};

const DEFAULT_FIRINGS_LIMIT: u32 = 100;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/tenants", post(create_tenant))
        .route("/api/tenants/{tenant_id}", get(get_tenant))
        .route("/api/tenants/{tenant_id}/profile", put(update_profile))
        .route("/api/tenants/{tenant_id}/enabled", post(set_enabled))
        .route("/api/tenants/{tenant_id}/leads", get(list_leads))
        .route("/api/tenants/{tenant_id}/leads/summary", get(lead_summary))
        .route(
            "/api/tenants/{tenant_id}/leads/{lead_id}",
            get(get_lead).patch(update_lead).delete(delete_lead),
        )
        .route(
            "/api/tenants/{tenant_id}/leads/{lead_id}/status",
            post(update_lead_status),
        )
        .route(
            "/api/tenants/{tenant_id}/automations",
            get(list_rules).post(create_rule),
        )
        .route(
            "/api/tenants/{tenant_id}/automations/{rule_id}",
            put(update_rule).delete(delete_rule),
        )
        .route(
            "/api/tenants/{tenant_id}/automations/{rule_id}/active",
            post(set_rule_active),
        )
        .route("/api/tenants/{tenant_id}/firings", get(list_firings))
}

// ── Tenants ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct EnabledRequest {
    enabled: bool,
}

async fn require_tenant(state: &AppState, tenant_id: Uuid) -> Result<Tenant, ApiError> {
    state
        .store
        .get_tenant(tenant_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("tenant not found: {tenant_id}")))
}

/// POST /api/tenants
///
/// The response is the only place the webhook token is ever returned.
async fn create_tenant(
    State(state): State<AppState>,
    Json(profile): Json<TenantProfile>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = Tenant::new(profile, Utc::now());
    state.store.create_tenant(&tenant).await?;
    info!(tenant_id = %tenant.id, "Tenant provisioned");
    Ok((StatusCode::CREATED, Json(tenant.into_issued())))
}

async fn get_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(require_tenant(&state, tenant_id).await?))
}

async fn update_profile(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(profile): Json<TenantProfile>,
) -> Result<impl IntoResponse, ApiError> {
    let mut tenant = require_tenant(&state, tenant_id).await?;
    tenant.apply_profile(profile, Utc::now());
    if !state.store.update_tenant_profile(&tenant).await? {
        return Err(ApiError::NotFound(format!("tenant not found: {tenant_id}")));
    }
    Ok(Json(tenant))
}

async fn set_enabled(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(req): Json<EnabledRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.store.set_tenant_enabled(tenant_id, req.enabled).await? {
        return Err(ApiError::NotFound(format!("tenant not found: {tenant_id}")));
    }
    info!(%tenant_id, enabled = req.enabled, "Tenant webhook toggled");
    Ok(Json(require_tenant(&state, tenant_id).await?))
}

// ── Leads ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StatusRequest {
    status: LeadStatus,
}

async fn list_leads(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(filter): Query<LeadFilter>,
) -> Result<impl IntoResponse, ApiError> {
    require_tenant(&state, tenant_id).await?;
    Ok(Json(state.leads.list(tenant_id, &filter).await?))
}

async fn lead_summary(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    require_tenant(&state, tenant_id).await?;
    Ok(Json(state.leads.summary(tenant_id).await?))
}

async fn get_lead(
    State(state): State<AppState>,
    Path((tenant_id, lead_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.leads.get(tenant_id, lead_id).await?))
}

async fn update_lead(
    State(state): State<AppState>,
    Path((tenant_id, lead_id)): Path<(Uuid, Uuid)>,
    Json(update): Json<LeadUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state.leads.update_details(tenant_id, lead_id, &update).await?,
    ))
}

async fn delete_lead(
    State(state): State<AppState>,
    Path((tenant_id, lead_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    state.leads.delete(tenant_id, lead_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/tenants/{tenant_id}/leads/{lead_id}/status
///
/// `409` when a concurrent edit moved the lead first.
async fn update_lead_status(
    State(state): State<AppState>,
    Path((tenant_id, lead_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<StatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state
            .leads
            .update_status(tenant_id, lead_id, req.status)
            .await?,
    ))
}

// ── Automations ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ActiveRequest {
    is_active: bool,
}

async fn list_rules(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    require_tenant(&state, tenant_id).await?;
    Ok(Json(state.rules.list(tenant_id).await?))
}

async fn create_rule(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(draft): Json<RuleDraft>,
) -> Result<impl IntoResponse, ApiError> {
    require_tenant(&state, tenant_id).await?;
    let rule = state.rules.create(tenant_id, draft).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn update_rule(
    State(state): State<AppState>,
    Path((tenant_id, rule_id)): Path<(Uuid, Uuid)>,
    Json(draft): Json<RuleDraft>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.rules.update(tenant_id, rule_id, draft).await?))
}

async fn delete_rule(
    State(state): State<AppState>,
    Path((tenant_id, rule_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    state.rules.delete(tenant_id, rule_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_rule_active(
    State(state): State<AppState>,
    Path((tenant_id, rule_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<ActiveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state
            .rules
            .set_active(tenant_id, rule_id, req.is_active)
            .await?,
    ))
}

// ── Firings ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct FiringsQuery {
    status: Option<FiringStatus>,
    limit: Option<u32>,
}

async fn list_firings(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<FiringsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_tenant(&state, tenant_id).await?;
    let limit = query.limit.unwrap_or(DEFAULT_FIRINGS_LIMIT);
    Ok(Json(
        state.rules.firings(tenant_id, query.status, limit).await?,
    ))
}
