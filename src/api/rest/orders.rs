use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::engine::coordinator::{NewOrder, SignalOutcome};
use crate::error::DispatchError;
use crate::models::offer::{CourierSignal, Offer, RefusalRecord};
use crate::models::order::Order;
use crate::state::AppState;
use crate::store::OrderStore;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/offer", post(offer_order))
        .route("/orders/:id/respond", post(respond_to_offer))
        .route("/orders/:id/unassign", post(unassign_order))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/orders/:id/refusals", get(list_order_refusals))
        .route("/offers", get(list_offers))
}

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub reference: Option<String>,
    pub pickup_address: String,
    pub delivery_address: String,
    pub price: f64,
    pub scheduled_pickup_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct OfferRequest {
    pub courier_id: Uuid,
}

#[derive(Deserialize)]
pub struct RespondRequest {
    pub courier_id: Uuid,
    pub signal: CourierSignal,
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct ReasonRequest {
    pub reason: Option<String>,
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<Json<Order>, DispatchError> {
    let order = state
        .coordinator
        .register_order(NewOrder {
            reference: payload.reference,
            pickup_address: payload.pickup_address,
            delivery_address: payload.delivery_address,
            price: payload.price,
            scheduled_pickup_at: payload.scheduled_pickup_at,
        })
        .await?;

    Ok(Json(order))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, DispatchError> {
    let order = state
        .orders
        .get(id)
        .await
        .map_err(|_| DispatchError::OrderNotFound(id))?;

    Ok(Json(order))
}

async fn list_orders(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Order>>, DispatchError> {
    let mut orders = state
        .orders
        .list()
        .await
        .map_err(|err| DispatchError::Internal(err.to_string()))?;
    orders.sort_by_key(|order| order.created_at);

    Ok(Json(orders))
}

async fn offer_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<OfferRequest>,
) -> Result<Json<Offer>, DispatchError> {
    let offer = state.coordinator.offer(id, payload.courier_id).await?;
    Ok(Json(offer))
}

async fn respond_to_offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RespondRequest>,
) -> Result<Json<Value>, DispatchError> {
    let outcome = state
        .coordinator
        .apply_courier_response(id, payload.courier_id, payload.signal, payload.reason)
        .await?;

    let body = match outcome {
        SignalOutcome::Applied(order) => json!({ "applied": true, "order": order }),
        SignalOutcome::Ignored(reason) => json!({ "applied": false, "reason": reason }),
    };
    Ok(Json(body))
}

async fn unassign_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReasonRequest>,
) -> Result<Json<Order>, DispatchError> {
    let reason = payload
        .reason
        .unwrap_or_else(|| "unassigned by operator".to_string());
    let order = state.coordinator.unassign(id, reason).await?;
    Ok(Json(order))
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReasonRequest>,
) -> Result<Json<Order>, DispatchError> {
    let reason = payload
        .reason
        .unwrap_or_else(|| "cancelled by operator".to_string());
    let order = state.coordinator.cancel(id, reason).await?;
    Ok(Json(order))
}

async fn list_order_refusals(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Json<Vec<RefusalRecord>> {
    Json(state.coordinator.refusal_ledger().records(id))
}

async fn list_offers(State(state): State<Arc<AppState>>) -> Json<Vec<Offer>> {
    Json(state.coordinator.outstanding_offers())
}
