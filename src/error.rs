use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::order::OrderStatus;
use crate::store::{OtpError, StoreError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("order {0} not found")]
    OrderNotFound(Uuid),

    #[error("agent {0} not found")]
    AgentNotFound(Uuid),

    #[error("cannot move order from {from:?} to {to:?}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("invalid delivery code: {0}")]
    InvalidOtp(#[from] OtpError),

    #[error("order {0} has no assigned agent")]
    AgentRequired(Uuid),

    #[error("agent {0} is not available")]
    AgentUnavailable(Uuid),

    #[error("{0}")]
    NotApplicable(String),

    #[error("gave up after repeated write conflicts on {0}")]
    Contention(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::OrderNotFound(_) => "order_not_found",
            EngineError::AgentNotFound(_) => "agent_not_found",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::InvalidOtp(_) => "invalid_otp",
            EngineError::AgentRequired(_) => "agent_required",
            EngineError::AgentUnavailable(_) => "agent_unavailable",
            EngineError::NotApplicable(_) => "not_applicable",
            EngineError::Contention(_) => "contention",
            EngineError::Timeout(_) => "timeout",
            EngineError::Store(_) => "store",
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unprocessable: {0}")]
    Unprocessable(String),

    #[error("no agents available")]
    NoAvailableAgents,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::OrderNotFound(_) | EngineError::AgentNotFound(_) => {
                AppError::NotFound(err.to_string())
            }
            EngineError::InvalidTransition { .. }
            | EngineError::NotApplicable(_)
            | EngineError::Contention(_)
            | EngineError::Store(StoreError::Conflict(_))
            | EngineError::Store(StoreError::Duplicate(_)) => AppError::Conflict(err.to_string()),
            EngineError::InvalidOtp(_)
            | EngineError::AgentRequired(_)
            | EngineError::Store(StoreError::Otp(_)) => {
                AppError::Unprocessable(err.to_string())
            }
            EngineError::AgentUnavailable(_) => AppError::NoAvailableAgents,
            EngineError::Timeout(_) | EngineError::Store(StoreError::Unavailable(_)) => {
                AppError::Internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::NoAvailableAgents => (
                StatusCode::SERVICE_UNAVAILABLE,
                "no agents available".to_string(),
            ),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}
