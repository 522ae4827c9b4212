use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::directory::{BulkSummary, NewAgent};
use crate::engine::scheduler::ReleaseOutcome;
use crate::error::AppError;
use crate::models::agent::{AccountStatus, Agent, Availability, GeoPoint};
use crate::state::AppState;
use crate::store::AgentQuery;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/agents", post(create_agent).get(list_agents))
        .route("/agents/:id", get(get_agent))
        .route("/agents/:id/availability", patch(update_availability))
        .route("/agents/:id/account", patch(update_account_status))
        .route("/agents/:id/location", patch(update_location))
        .route("/agents/:id/release", post(release_agent))
        .route("/bulk/agents/availability", post(bulk_availability))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateAgentRequest {
    pub name: String,
    pub phone: String,
    #[serde(default = "default_account_status")]
    pub account_status: AccountStatus,
    #[serde(default)]
    pub location: Option<GeoPoint>,
}

#[derive(Deserialize)]
pub struct ListAgentsQuery {
    pub availability: Option<Availability>,
    pub account_status: Option<AccountStatus>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateAvailabilityRequest {
    pub availability: Availability,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateAccountRequest {
    pub account_status: AccountStatus,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateLocationRequest {
    pub location: GeoPoint,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BulkAvailabilityRequest {
    pub agent_ids: Vec<Uuid>,
    pub availability: Availability,
}

#[derive(Serialize)]
pub struct ReleaseResponse {
    pub agent_id: Uuid,
    pub outcome: ReleaseOutcome,
}

fn default_account_status() -> AccountStatus {
    AccountStatus::Pending
}

fn validate_point(point: &GeoPoint) -> Result<(), AppError> {
    if !(-90.0..=90.0).contains(&point.lat) || !(-180.0..=180.0).contains(&point.lng) {
        return Err(AppError::BadRequest("location out of range".to_string()));
    }
    Ok(())
}

async fn create_agent(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateAgentRequest>,
) -> Result<Json<Agent>, AppError> {
    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("name cannot be empty".to_string()));
    }
    if payload.phone.trim().is_empty() {
        return Err(AppError::BadRequest("phone cannot be empty".to_string()));
    }
    if let Some(point) = &payload.location {
        validate_point(point)?;
    }

    let agent = state
        .engine
        .directory()
        .register(NewAgent {
            name: payload.name,
            phone: payload.phone,
            account_status: payload.account_status,
            location: payload.location,
        })
        .await?;

    Ok(Json(agent))
}

async fn list_agents(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListAgentsQuery>,
) -> Result<Json<Vec<Agent>>, AppError> {
    let query = AgentQuery {
        account_status: params.account_status,
        availability: params.availability,
        limit: None,
    };
    Ok(Json(state.engine.directory().list(&query).await?))
}

async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Agent>, AppError> {
    Ok(Json(state.engine.directory().get(id).await?))
}

async fn update_availability(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateAvailabilityRequest>,
) -> Result<Json<Agent>, AppError> {
    let agent = state
        .engine
        .directory()
        .set_availability(id, payload.availability)
        .await?;
    Ok(Json(agent))
}

async fn update_account_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateAccountRequest>,
) -> Result<Json<Agent>, AppError> {
    let agent = state
        .engine
        .directory()
        .set_account_status(id, payload.account_status)
        .await?;
    Ok(Json(agent))
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateLocationRequest>,
) -> Result<Json<Agent>, AppError> {
    validate_point(&payload.location)?;

    let agent = state
        .engine
        .directory()
        .update_location(id, payload.location)
        .await?;
    Ok(Json(agent))
}

async fn release_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReleaseResponse>, AppError> {
    let outcome = state.engine.release(id).await?;
    Ok(Json(ReleaseResponse {
        agent_id: id,
        outcome,
    }))
}

async fn bulk_availability(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<BulkAvailabilityRequest>,
) -> Result<Json<BulkSummary>, AppError> {
    if payload.agent_ids.is_empty() {
        return Err(AppError::BadRequest("agent_ids cannot be empty".to_string()));
    }

    let summary = state
        .engine
        .directory()
        .bulk_set_availability(&payload.agent_ids, payload.availability)
        .await;
    Ok(Json(summary))
}
