use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("order {0} not found")]
    OrderNotFound(Uuid),

    #[error("courier {0} not found")]
    CourierNotFound(Uuid),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("order not eligible: {0}")]
    NotEligible(String),

    #[error("order already assigned")]
    AlreadyAssigned,

    #[error("courier unavailable")]
    CourierUnavailable,

    #[error("dispatch gate closed until {opens_at}")]
    GateClosed { opens_at: DateTime<Utc> },

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Label used on outcome-partitioned metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::OrderNotFound(_) | Self::CourierNotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::NotEligible(_) => "not_eligible",
            Self::AlreadyAssigned => "already_assigned",
            Self::CourierUnavailable => "courier_unavailable",
            Self::GateClosed { .. } => "gate_closed",
            Self::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = match &self {
            DispatchError::OrderNotFound(_) | DispatchError::CourierNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            DispatchError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DispatchError::NotEligible(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DispatchError::AlreadyAssigned | DispatchError::CourierUnavailable => {
                StatusCode::CONFLICT
            }
            DispatchError::GateClosed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // GateClosed carries the unlock time so consoles can render a countdown
        // instead of a blocking error.
        let body = match &self {
            DispatchError::GateClosed { opens_at } => Json(json!({
                "error": self.to_string(),
                "kind": self.outcome(),
                "opens_at": opens_at,
            })),
            _ => Json(json!({
                "error": self.to_string(),
                "kind": self.outcome(),
            })),
        };

        (status, body).into_response()
    }
}
