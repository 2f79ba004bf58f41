use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::feed::{ChangeFeed, FeedEvent};
use crate::models::order::Order;
use crate::state::AppState;
use crate::store::OrderStore;

/// A deferred order may not be offered earlier than this long before its
/// scheduled pickup.
pub const GATE_WINDOW_MINUTES: i64 = 45;

/// Unlock time for a deferred order; `None` for immediate jobs, which have no
/// gate at all.
pub fn opens_at(order: &Order) -> Option<DateTime<Utc>> {
    order
        .scheduled_pickup_at
        .map(|pickup| pickup - Duration::minutes(GATE_WINDOW_MINUTES))
}

pub fn is_open(order: &Order, now: DateTime<Utc>) -> bool {
    match opens_at(order) {
        Some(unlock) => now >= unlock,
        None => true,
    }
}

pub fn check(order: &Order, now: DateTime<Utc>) -> Result<(), DispatchError> {
    match opens_at(order) {
        Some(unlock) if now < unlock => Err(DispatchError::GateClosed { opens_at: unlock }),
        _ => Ok(()),
    }
}

/// Fixed-interval reevaluation loop. There is no per-order timer: each tick
/// scans dispatchable deferred orders, announces the ones whose window just
/// opened, and sweeps for stuck couriers so the operator console gets a
/// repair affordance instead of a silent fix.
pub async fn run_gate_tick(state: Arc<AppState>, tick: std::time::Duration) {
    info!(tick_secs = tick.as_secs(), "gate tick started");

    let mut interval = tokio::time::interval(tick);
    let mut announced: HashSet<Uuid> = HashSet::new();

    loop {
        interval.tick().await;

        let now = state.clock.now();

        match state.orders.list().await {
            Ok(orders) => {
                let mut still_pending: HashSet<Uuid> = HashSet::new();

                for order in orders {
                    let dispatchable = !order.status.is_terminal()
                        && !order.status.is_active_assignment()
                        && order.scheduled_pickup_at.is_some();

                    if !dispatchable {
                        continue;
                    }

                    if !is_open(&order, now) {
                        still_pending.insert(order.id);
                        continue;
                    }

                    if announced.insert(order.id) {
                        info!(order_id = %order.id, reference = %order.reference, "dispatch gate opened");
                        state.feed.publish(FeedEvent::GateOpened { order_id: order.id });
                    }
                    still_pending.insert(order.id);
                }

                // Forget orders that left the dispatchable pool so the set
                // stays bounded and a re-deferred order gets re-announced.
                announced.retain(|id| still_pending.contains(id));
            }
            Err(err) => error!(error = %err, "gate tick failed to list orders"),
        }

        match state.coordinator.stuck_couriers().await {
            Ok(stuck) => {
                state.metrics.stuck_couriers.set(stuck.len() as i64);
                for courier in stuck {
                    warn!(
                        courier_id = %courier.id,
                        name = %courier.name,
                        "courier is busy with no active order; needs force-available repair"
                    );
                }
            }
            Err(err) => error!(error = %err, "stuck courier sweep failed"),
        }
    }
}
