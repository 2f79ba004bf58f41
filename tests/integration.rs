use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration, TimeZone, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

use courier_dispatch::api::rest::router;
use courier_dispatch::board::run_board_projector;
use courier_dispatch::clock::{Clock, ManualClock, SystemClock};
use courier_dispatch::models::courier::Availability;
use courier_dispatch::state::AppState;
use courier_dispatch::store::CourierStore;

fn setup() -> (axum::Router, Arc<AppState>) {
    let state = Arc::new(AppState::new(1024, 900, Arc::new(SystemClock)));
    (router(state.clone()), state)
}

fn setup_with_clock(clock: Arc<ManualClock>) -> (axum::Router, Arc<AppState>) {
    let state = Arc::new(AppState::new(1024, 900, clock));
    (router(state.clone()), state)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn create_online_courier(app: &axum::Router, name: &str) -> String {
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/couriers",
            json!({ "name": name, "vehicle": "cargo bike" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let courier = body_json(res).await;
    let id = courier["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(json_request(
            "PATCH",
            &format!("/couriers/{id}/availability"),
            json!({ "availability": "online" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    id
}

async fn create_order(app: &axum::Router, reference: &str) -> String {
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/orders",
            json!({
                "reference": reference,
                "pickup_address": "12 rue du Faubourg, Paris",
                "delivery_address": "4 avenue des Ternes, Paris",
                "price": 38.5
            }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let order = body_json(res).await;
    order["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_returns_ok() {
    let (app, _state) = setup();
    let response = app.oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["couriers"], 0);
    assert_eq!(body["orders"], 0);
    assert_eq!(body["outstanding_offers"], 0);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let (app, _state) = setup();
    let response = app.oneshot(get_request("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));

    let body = body_string(response).await;
    assert!(body.contains("stuck_couriers"));
}

#[tokio::test]
async fn create_courier_starts_offline() {
    let (app, _state) = setup();
    let response = app
        .oneshot(json_request(
            "POST",
            "/couriers",
            json!({ "name": "Lena Martin", "vehicle": "scooter" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["name"], "Lena Martin");
    assert_eq!(body["vehicle"], "scooter");
    assert_eq!(body["availability"], "offline");
    assert!(!body["id"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn create_courier_empty_name_returns_400() {
    let (app, _state) = setup();
    let response = app
        .oneshot(json_request("POST", "/couriers", json!({ "name": "  " })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_order_returns_ready_order() {
    let (app, _state) = setup();
    let response = app
        .oneshot(json_request(
            "POST",
            "/orders",
            json!({
                "pickup_address": "12 rue du Faubourg, Paris",
                "delivery_address": "4 avenue des Ternes, Paris",
                "price": 24.0
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ready");
    assert!(body["assigned_courier_id"].is_null());
    assert_eq!(body["refusal_count"], 0);
    assert!(body["reference"].as_str().unwrap().starts_with("CMD-"));
}

#[tokio::test]
async fn create_order_empty_pickup_returns_400() {
    let (app, _state) = setup();
    let response = app
        .oneshot(json_request(
            "POST",
            "/orders",
            json!({
                "pickup_address": "",
                "delivery_address": "4 avenue des Ternes, Paris",
                "price": 24.0
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn get_nonexistent_order_returns_404() {
    let (app, _state) = setup();
    let fake_id = "00000000-0000-0000-0000-000000000000";
    let response = app
        .oneshot(get_request(&format!("/orders/{fake_id}")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn full_dispatch_flow() {
    let (app, _state) = setup();
    let courier_id = create_online_courier(&app, "driver-1").await;
    let order_id = create_order(&app, "A-100").await;

    // Offer the job to exactly one courier.
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/offer"),
            json!({ "courier_id": courier_id }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let offer = body_json(res).await;
    assert_eq!(offer["order_id"], order_id);
    assert_eq!(offer["courier_id"], courier_id);

    let res = app
        .clone()
        .oneshot(get_request(&format!("/orders/{order_id}")))
        .await
        .unwrap();
    let order = body_json(res).await;
    assert_eq!(order["status"], "offered");
    assert_eq!(order["assigned_courier_id"], courier_id);

    // Courier accepts.
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/respond"),
            json!({ "courier_id": courier_id, "signal": "accept" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let outcome = body_json(res).await;
    assert_eq!(outcome["applied"], true);
    assert_eq!(outcome["order"]["status"], "courier_accepted");

    let res = app.clone().oneshot(get_request("/couriers")).await.unwrap();
    let couriers = body_json(res).await;
    assert_eq!(couriers[0]["availability"], "busy");

    // Delivery completes; the courier is freed and the assignment cleared.
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/respond"),
            json!({ "courier_id": courier_id, "signal": "delivered" }),
        ))
        .await
        .unwrap();
    let outcome = body_json(res).await;
    assert_eq!(outcome["applied"], true);
    assert_eq!(outcome["order"]["status"], "delivered");
    assert!(outcome["order"]["assigned_courier_id"].is_null());

    let res = app.clone().oneshot(get_request("/couriers")).await.unwrap();
    let couriers = body_json(res).await;
    assert_eq!(couriers[0]["availability"], "online");

    let res = app.oneshot(get_request("/offers")).await.unwrap();
    let offers = body_json(res).await;
    assert_eq!(offers.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn second_offer_for_same_order_returns_conflict() {
    let (app, _state) = setup();
    let first = create_online_courier(&app, "driver-1").await;
    let second = create_online_courier(&app, "driver-2").await;
    let order_id = create_order(&app, "A-101").await;

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/offer"),
            json!({ "courier_id": first }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/offer"),
            json!({ "courier_id": second }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body = body_json(res).await;
    assert_eq!(body["kind"], "already_assigned");
}

#[tokio::test]
async fn offer_to_busy_courier_returns_conflict() {
    let (app, _state) = setup();
    let courier_id = create_online_courier(&app, "driver-1").await;
    let first_order = create_order(&app, "A-102").await;
    let second_order = create_order(&app, "A-103").await;

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{first_order}/offer"),
            json!({ "courier_id": courier_id }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{second_order}/offer"),
            json!({ "courier_id": courier_id }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body = body_json(res).await;
    assert_eq!(body["kind"], "courier_unavailable");
}

#[tokio::test]
async fn gate_closed_offer_returns_countdown_then_opens() {
    let start = Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let (app, _state) = setup_with_clock(clock.clone());

    let courier_id = create_online_courier(&app, "driver-1").await;

    let pickup = clock.now() + Duration::hours(2);
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/orders",
            json!({
                "reference": "A-104",
                "pickup_address": "12 rue du Faubourg, Paris",
                "delivery_address": "4 avenue des Ternes, Paris",
                "price": 61.0,
                "scheduled_pickup_at": pickup
            }),
        ))
        .await
        .unwrap();
    let order = body_json(res).await;
    let order_id = order["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/offer"),
            json!({ "courier_id": courier_id }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(res).await;
    assert_eq!(body["kind"], "gate_closed");
    assert!(body["opens_at"].is_string());

    // 80 minutes later the pickup is 40 minutes out: inside the 45-minute
    // window, so the same offer goes through.
    clock.advance(Duration::minutes(80));
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/offer"),
            json!({ "courier_id": courier_id }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn refusal_cycle_over_rest() {
    let start = Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let (app, _state) = setup_with_clock(clock.clone());

    let first = create_online_courier(&app, "driver-1").await;
    let second = create_online_courier(&app, "driver-2").await;
    let order_id = create_order(&app, "A-105").await;

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/offer"),
            json!({ "courier_id": first }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/respond"),
            json!({ "courier_id": first, "signal": "refuse", "reason": "too far" }),
        ))
        .await
        .unwrap();
    let outcome = body_json(res).await;
    assert_eq!(outcome["applied"], true);
    assert_eq!(outcome["order"]["status"], "refused");
    assert!(outcome["order"]["assigned_courier_id"].is_null());
    assert_eq!(outcome["order"]["refusal_count"], 1);
    assert_eq!(outcome["order"]["last_refused_by"], first);

    let res = app
        .clone()
        .oneshot(get_request(&format!("/orders/{order_id}/refusals")))
        .await
        .unwrap();
    let refusals = body_json(res).await;
    assert_eq!(refusals.as_array().unwrap().len(), 1);
    assert_eq!(refusals[0]["courier_id"], first);
    assert_eq!(refusals[0]["reason"], "too far");

    // The refuser is in cooldown; a different courier can take it now.
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/offer"),
            json!({ "courier_id": first }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/offer"),
            json!({ "courier_id": second }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn duplicate_accept_is_reported_as_not_applied() {
    let (app, _state) = setup();
    let courier_id = create_online_courier(&app, "driver-1").await;
    let order_id = create_order(&app, "A-106").await;

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/offer"),
            json!({ "courier_id": courier_id }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    for expected_applied in [true, false] {
        let res = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/orders/{order_id}/respond"),
                json!({ "courier_id": courier_id, "signal": "accept" }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let outcome = body_json(res).await;
        assert_eq!(outcome["applied"], expected_applied);
    }

    let res = app
        .oneshot(get_request(&format!("/orders/{order_id}")))
        .await
        .unwrap();
    let order = body_json(res).await;
    assert_eq!(order["status"], "courier_accepted");
}

#[tokio::test]
async fn unassign_returns_order_to_the_pool() {
    let (app, _state) = setup();
    let courier_id = create_online_courier(&app, "driver-1").await;
    let order_id = create_order(&app, "A-107").await;

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/offer"),
            json!({ "courier_id": courier_id }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/unassign"),
            json!({ "reason": "courier not responding" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let order = body_json(res).await;
    assert_eq!(order["status"], "ready");
    assert!(order["assigned_courier_id"].is_null());

    let res = app.oneshot(get_request("/couriers")).await.unwrap();
    let couriers = body_json(res).await;
    assert_eq!(couriers[0]["availability"], "online");
}

#[tokio::test]
async fn cancel_is_terminal() {
    let (app, _state) = setup();
    let order_id = create_order(&app, "A-108").await;

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/cancel"),
            json!({ "reason": "client cancelled" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let order = body_json(res).await;
    assert_eq!(order["status"], "cancelled");

    let res = app
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/cancel"),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn stuck_courier_is_flagged_and_repaired() {
    let (app, state) = setup();
    let courier_id = create_online_courier(&app, "driver-1").await;

    // Simulate a lost refusal signal: busy in the registry, nothing assigned.
    state
        .couriers
        .update_availability(
            courier_id.parse().unwrap(),
            Availability::Busy,
            state.clock.now(),
        )
        .await
        .unwrap();

    let res = app
        .clone()
        .oneshot(get_request("/couriers/stuck"))
        .await
        .unwrap();
    let stuck = body_json(res).await;
    assert_eq!(stuck.as_array().unwrap().len(), 1);
    assert_eq!(stuck[0]["id"], courier_id);

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/couriers/{courier_id}/force-available"),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let courier = body_json(res).await;
    assert_eq!(courier["availability"], "online");

    let res = app.oneshot(get_request("/couriers/stuck")).await.unwrap();
    let stuck = body_json(res).await;
    assert_eq!(stuck.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn board_projects_the_four_columns() {
    let (app, state) = setup();
    tokio::spawn(run_board_projector(state.clone()));

    let courier_id = create_online_courier(&app, "driver-1").await;
    let offered_order = create_order(&app, "A-109").await;
    let _waiting_order = create_order(&app, "A-110").await;

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{offered_order}/offer"),
            json!({ "courier_id": courier_id }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

    let res = app.oneshot(get_request("/board")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let board = body_json(res).await;

    assert_eq!(board["ready"].as_array().unwrap().len(), 1);
    assert_eq!(board["offered"].as_array().unwrap().len(), 1);
    assert_eq!(board["offered"][0]["order_id"], offered_order);
    assert_eq!(board["offered"][0]["courier_id"], courier_id);
    assert_eq!(board["accepted"].as_array().unwrap().len(), 0);
    assert_eq!(board["in_progress"].as_array().unwrap().len(), 0);
}
