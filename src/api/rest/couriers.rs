use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::coordinator::NewCourier;
use crate::error::DispatchError;
use crate::models::courier::{Availability, Courier};
use crate::state::AppState;
use crate::store::CourierStore;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/couriers", post(create_courier).get(list_couriers))
        .route("/couriers/stuck", get(list_stuck_couriers))
        .route("/couriers/:id/availability", patch(update_availability))
        .route("/couriers/:id/force-available", post(force_available))
}

#[derive(Deserialize)]
pub struct CreateCourierRequest {
    pub name: String,
    pub vehicle: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateAvailabilityRequest {
    pub availability: Availability,
}

async fn create_courier(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateCourierRequest>,
) -> Result<Json<Courier>, DispatchError> {
    let courier = state
        .coordinator
        .register_courier(NewCourier {
            name: payload.name,
            vehicle: payload.vehicle,
        })
        .await?;

    Ok(Json(courier))
}

async fn list_couriers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Courier>>, DispatchError> {
    let mut couriers = state
        .couriers
        .list()
        .await
        .map_err(|err| DispatchError::Internal(err.to_string()))?;
    couriers.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(Json(couriers))
}

async fn list_stuck_couriers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Courier>>, DispatchError> {
    let stuck = state.coordinator.stuck_couriers().await?;
    state.metrics.stuck_couriers.set(stuck.len() as i64);

    Ok(Json(stuck))
}

async fn update_availability(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateAvailabilityRequest>,
) -> Result<Json<Courier>, DispatchError> {
    let courier = state
        .coordinator
        .set_availability(id, payload.availability)
        .await?;

    Ok(Json(courier))
}

async fn force_available(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Courier>, DispatchError> {
    let courier = state.coordinator.force_available(id).await?;
    Ok(Json(courier))
}
