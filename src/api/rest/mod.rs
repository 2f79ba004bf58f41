pub mod couriers;
pub mod orders;
pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde::Serialize;
use tower_http::services::ServeDir;

use crate::board::BoardSnapshot;
use crate::error::DispatchError;
use crate::state::AppState;
use crate::store::{CourierStore, OrderStore};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(couriers::router())
        .merge(orders::router())
        .route("/board", get(board))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        .fallback_service(ServeDir::new("static"))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    couriers: usize,
    orders: usize,
    outstanding_offers: usize,
}

async fn health(
    State(state): State<Arc<AppState>>,
) -> Result<Json<HealthResponse>, DispatchError> {
    let couriers = state
        .couriers
        .list()
        .await
        .map_err(|err| DispatchError::Internal(err.to_string()))?
        .len();
    let orders = state
        .orders
        .list()
        .await
        .map_err(|err| DispatchError::Internal(err.to_string()))?
        .len();

    Ok(Json(HealthResponse {
        status: "ok",
        couriers,
        orders,
        outstanding_offers: state.coordinator.outstanding_offers().len(),
    }))
}

async fn board(State(state): State<Arc<AppState>>) -> Json<BoardSnapshot> {
    Json(state.board.snapshot())
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
    }
}
