use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::directory::BulkSummary;
use crate::engine::lifecycle::{DispatchOutcome, NewOrder, TransitionRequest};
use crate::engine::scheduler::{AssignOutcome, SweepReport};
use crate::error::AppError;
use crate::models::order::{
    Actor, DeliveryChannel, DeliveryProof, Order, OrderStatus, Payment, PaymentMethod,
    PaymentStatus, PrintItem,
};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/status", post(transition_order))
        .route("/orders/:id/dispatch", post(dispatch_order))
        .route("/orders/:id/assign", post(assign_order))
        .route("/orders/:id/reassign", post(reassign_order))
        .route("/bulk/orders/status", post(bulk_transition))
        .route("/sweeps/auto-assign", post(run_sweep))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PaymentRequest {
    pub method: PaymentMethod,
    pub status: PaymentStatus,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateOrderRequest {
    pub customer_id: String,
    pub customer_phone: String,
    pub delivery_address: String,
    pub items: Vec<PrintItem>,
    pub channel: DeliveryChannel,
    pub payment: PaymentRequest,
    #[serde(default)]
    pub urgent: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransitionBody {
    pub status: OrderStatus,
    pub actor: Actor,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub proof: Option<DeliveryProof>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReassignBody {
    pub agent_id: Uuid,
    pub reason: String,
    #[serde(default = "default_admin")]
    pub actor: Actor,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BulkTransitionBody {
    pub order_ids: Vec<Uuid>,
    pub status: OrderStatus,
    pub actor: Actor,
    #[serde(default)]
    pub note: Option<String>,
}

fn default_admin() -> Actor {
    Actor::Admin
}

fn require(value: &str, field: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::BadRequest(format!("{field} cannot be empty")));
    }
    Ok(())
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<Json<Order>, AppError> {
    require(&payload.customer_id, "customer_id")?;
    require(&payload.customer_phone, "customer_phone")?;
    require(&payload.delivery_address, "delivery_address")?;

    if payload.items.is_empty() {
        return Err(AppError::BadRequest("order needs at least one item".to_string()));
    }
    if payload.items.iter().any(|item| item.pages == 0) {
        return Err(AppError::BadRequest("item pages must be > 0".to_string()));
    }

    let order = state
        .engine
        .create_order(NewOrder {
            customer_id: payload.customer_id,
            customer_phone: payload.customer_phone,
            delivery_address: payload.delivery_address,
            items: payload.items,
            channel: payload.channel,
            payment: Payment {
                method: payload.payment.method,
                status: payload.payment.status,
            },
            urgent: payload.urgent,
        })
        .await?;

    Ok(Json(order))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.engine.get_order(id).await?))
}

async fn transition_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<TransitionBody>,
) -> Result<Json<Order>, AppError> {
    if let Some(rating) = payload.proof.as_ref().and_then(|proof| proof.rating) {
        if !(1.0..=5.0).contains(&rating) {
            return Err(AppError::BadRequest("rating must be between 1 and 5".to_string()));
        }
    }

    let order = state
        .engine
        .transition(TransitionRequest {
            order_id: id,
            target: payload.status,
            actor: payload.actor,
            note: payload.note,
            proof: payload.proof,
            reason: payload.reason,
        })
        .await?;

    Ok(Json(order))
}

async fn dispatch_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DispatchOutcome>, AppError> {
    Ok(Json(state.engine.dispatch(id).await?))
}

async fn assign_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<AssignOutcome>, AppError> {
    Ok(Json(state.engine.assign_single(id, Actor::Admin).await?))
}

async fn reassign_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReassignBody>,
) -> Result<Json<Order>, AppError> {
    require(&payload.reason, "reason")?;

    let order = state
        .engine
        .reassign(id, payload.agent_id, payload.reason, payload.actor)
        .await?;
    Ok(Json(order))
}

async fn bulk_transition(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<BulkTransitionBody>,
) -> Result<Json<BulkSummary>, AppError> {
    if payload.order_ids.is_empty() {
        return Err(AppError::BadRequest("order_ids cannot be empty".to_string()));
    }

    let summary = state
        .engine
        .bulk_transition(&payload.order_ids, payload.status, payload.actor, payload.note)
        .await;
    Ok(Json(summary))
}

async fn run_sweep(State(state): State<Arc<AppState>>) -> Result<Json<SweepReport>, AppError> {
    Ok(Json(state.engine.auto_assign_sweep().await?))
}
