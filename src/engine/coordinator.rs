use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::engine::gate;
use crate::engine::locks::LockTable;
use crate::engine::refusals::RefusalLedger;
use crate::error::DispatchError;
use crate::feed::{ChangeFeed, FeedEvent};
use crate::models::courier::{Availability, Courier};
use crate::models::offer::{CourierSignal, Offer, RefusalRecord};
use crate::models::order::{Order, OrderStatus};
use crate::observability::metrics::Metrics;
use crate::store::{CourierStore, OrderPatch, OrderStore, StoreError};

pub struct NewOrder {
    pub reference: Option<String>,
    pub pickup_address: String,
    pub delivery_address: String,
    pub price: f64,
    pub scheduled_pickup_at: Option<DateTime<Utc>>,
}

pub struct NewCourier {
    pub name: String,
    pub vehicle: Option<String>,
}

/// Result of folding a courier signal. Stale and duplicate signals are
/// ignored rather than erroring: the feed redelivers, and redelivery must
/// converge to the same state.
#[derive(Debug)]
pub enum SignalOutcome {
    Applied(Order),
    Ignored(&'static str),
}

/// Sole writer of order status and courier availability. Every operation
/// serializes on per-entity locks (order first, then courier) and
/// re-validates current state before writing, so racing operator actions and
/// redelivered courier signals cannot corrupt an assignment.
pub struct Coordinator {
    orders: Arc<dyn OrderStore>,
    couriers: Arc<dyn CourierStore>,
    ledger: Arc<RefusalLedger>,
    feed: Arc<dyn ChangeFeed>,
    clock: Arc<dyn Clock>,
    offers: DashMap<Uuid, Offer>,
    order_locks: LockTable,
    courier_locks: LockTable,
    refusal_cooldown: Duration,
    metrics: Metrics,
}

impl Coordinator {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        couriers: Arc<dyn CourierStore>,
        ledger: Arc<RefusalLedger>,
        feed: Arc<dyn ChangeFeed>,
        clock: Arc<dyn Clock>,
        refusal_cooldown: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            orders,
            couriers,
            ledger,
            feed,
            clock,
            offers: DashMap::new(),
            order_locks: LockTable::new(),
            courier_locks: LockTable::new(),
            refusal_cooldown,
            metrics,
        }
    }

    pub fn refusal_ledger(&self) -> &RefusalLedger {
        &self.ledger
    }

    pub fn outstanding_offers(&self) -> Vec<Offer> {
        let mut offers: Vec<Offer> = self
            .offers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        offers.sort_by_key(|offer| offer.issued_at);
        offers
    }

    pub async fn register_order(&self, new_order: NewOrder) -> Result<Order, DispatchError> {
        if new_order.pickup_address.trim().is_empty() {
            return Err(DispatchError::BadRequest(
                "pickup_address cannot be empty".to_string(),
            ));
        }
        if new_order.delivery_address.trim().is_empty() {
            return Err(DispatchError::BadRequest(
                "delivery_address cannot be empty".to_string(),
            ));
        }
        if !new_order.price.is_finite() || new_order.price < 0.0 {
            return Err(DispatchError::BadRequest("price must be >= 0".to_string()));
        }

        let now = self.clock.now();
        let id = Uuid::new_v4();

        // A pickup less than one gate window away is an immediate job.
        let scheduled_pickup_at = new_order
            .scheduled_pickup_at
            .filter(|pickup| *pickup - now > Duration::minutes(gate::GATE_WINDOW_MINUTES));

        let reference = new_order.reference.unwrap_or_else(|| {
            let mut tag = id.simple().to_string();
            tag.truncate(4);
            format!("CMD-{}-{}", now.format("%Y%m%d"), tag.to_uppercase())
        });

        let order = Order {
            id,
            reference,
            status: OrderStatus::Ready,
            pickup_address: new_order.pickup_address,
            delivery_address: new_order.delivery_address,
            price: new_order.price,
            scheduled_pickup_at,
            assigned_courier_id: None,
            refusal_count: 0,
            last_refused_by: None,
            created_at: now,
            updated_at: now,
        };

        self.orders
            .insert(order.clone())
            .await
            .map_err(|err| Self::order_err(id, err))?;
        self.feed.publish(FeedEvent::OrderChanged {
            order: order.clone(),
        });

        info!(order_id = %order.id, reference = %order.reference, "order registered");
        Ok(order)
    }

    pub async fn register_courier(&self, new_courier: NewCourier) -> Result<Courier, DispatchError> {
        if new_courier.name.trim().is_empty() {
            return Err(DispatchError::BadRequest("name cannot be empty".to_string()));
        }

        let courier = Courier {
            id: Uuid::new_v4(),
            name: new_courier.name,
            vehicle: new_courier.vehicle,
            availability: Availability::Offline,
            updated_at: self.clock.now(),
        };

        self.couriers
            .insert(courier.clone())
            .await
            .map_err(|err| Self::courier_err(courier.id, err))?;
        self.feed.publish(FeedEvent::CourierChanged {
            courier: courier.clone(),
        });

        info!(courier_id = %courier.id, name = %courier.name, "courier registered");
        Ok(courier)
    }

    /// Proposes the order to exactly one courier. Atomic at the entity-lock
    /// boundary: captures the order, marks the courier busy and records the
    /// outstanding offer, or changes nothing.
    pub async fn offer(&self, order_id: Uuid, courier_id: Uuid) -> Result<Offer, DispatchError> {
        let start = Instant::now();
        let result = self.offer_inner(order_id, courier_id).await;

        let outcome = match &result {
            Ok(_) => "issued",
            Err(err) => err.outcome(),
        };
        self.metrics
            .offers_total
            .with_label_values(&[outcome])
            .inc();
        self.metrics
            .dispatch_latency_seconds
            .with_label_values(&["offer"])
            .observe(start.elapsed().as_secs_f64());

        result
    }

    async fn offer_inner(&self, order_id: Uuid, courier_id: Uuid) -> Result<Offer, DispatchError> {
        let _order_guard = self.order_locks.acquire(order_id).await;
        let _courier_guard = self.courier_locks.acquire(courier_id).await;

        let order = self
            .orders
            .get(order_id)
            .await
            .map_err(|err| Self::order_err(order_id, err))?;

        match order.status {
            OrderStatus::Ready => {}
            OrderStatus::Refused => self.check_refusal_cooldown(&order, courier_id)?,
            status if status.is_active_assignment() => {
                return Err(DispatchError::AlreadyAssigned);
            }
            status => {
                return Err(DispatchError::NotEligible(format!(
                    "order is {}",
                    status.as_str()
                )));
            }
        }

        let now = self.clock.now();
        gate::check(&order, now)?;

        let courier = self
            .couriers
            .get(courier_id)
            .await
            .map_err(|err| Self::courier_err(courier_id, err))?;
        if courier.availability != Availability::Online {
            return Err(DispatchError::CourierUnavailable);
        }

        let patch = OrderPatch {
            status: OrderStatus::Offered,
            assigned_courier_id: Some(courier_id),
            refusal: None,
            updated_at: now,
        };
        let order = self
            .orders
            .update_status(order_id, &[order.status], patch)
            .await
            .map_err(|err| match err {
                StoreError::Conflict { .. } => DispatchError::AlreadyAssigned,
                other => Self::order_err(order_id, other),
            })?;

        let courier = self
            .couriers
            .update_availability(courier_id, Availability::Busy, now)
            .await
            .map_err(|err| Self::courier_err(courier_id, err))?;

        let offer = Offer {
            order_id,
            courier_id,
            issued_at: now,
        };
        self.offers.insert(order_id, offer.clone());

        self.feed.publish(FeedEvent::OfferIssued {
            offer: offer.clone(),
        });
        self.feed.publish(FeedEvent::OrderChanged {
            order: order.clone(),
        });
        self.feed.publish(FeedEvent::CourierChanged { courier });

        info!(
            order_id = %order_id,
            courier_id = %courier_id,
            reference = %order.reference,
            "offer issued"
        );
        Ok(offer)
    }

    fn check_refusal_cooldown(&self, order: &Order, courier_id: Uuid) -> Result<(), DispatchError> {
        let Some(last) = self.ledger.last_record(order.id) else {
            return Ok(());
        };
        if last.courier_id != courier_id {
            return Ok(());
        }

        let retry_at = last.refused_at + self.refusal_cooldown;
        if self.clock.now() < retry_at {
            return Err(DispatchError::NotEligible(format!(
                "courier refused this order; not re-offerable to them until {retry_at}"
            )));
        }
        Ok(())
    }

    /// The sole path by which courier-originated signals are folded into
    /// state. Idempotent under redelivery: anything that does not advance the
    /// delivery is ignored, never an error and never a backward move.
    pub async fn apply_courier_response(
        &self,
        order_id: Uuid,
        courier_id: Uuid,
        signal: CourierSignal,
        reason: Option<String>,
    ) -> Result<SignalOutcome, DispatchError> {
        let start = Instant::now();
        let result = self
            .apply_inner(order_id, courier_id, signal, reason)
            .await;

        let outcome = match &result {
            Ok(SignalOutcome::Applied(_)) => "applied",
            Ok(SignalOutcome::Ignored(_)) => "ignored",
            Err(err) => err.outcome(),
        };
        self.metrics
            .courier_signals_total
            .with_label_values(&[signal.as_str(), outcome])
            .inc();
        self.metrics
            .dispatch_latency_seconds
            .with_label_values(&["respond"])
            .observe(start.elapsed().as_secs_f64());

        result
    }

    async fn apply_inner(
        &self,
        order_id: Uuid,
        courier_id: Uuid,
        signal: CourierSignal,
        reason: Option<String>,
    ) -> Result<SignalOutcome, DispatchError> {
        let _order_guard = self.order_locks.acquire(order_id).await;
        let _courier_guard = self.courier_locks.acquire(courier_id).await;

        let order = self
            .orders
            .get(order_id)
            .await
            .map_err(|err| Self::order_err(order_id, err))?;

        // Covers redelivery after the assignment moved on (reassigned,
        // unassigned or terminal): the sender no longer holds the order.
        if order.assigned_courier_id != Some(courier_id) {
            return Ok(SignalOutcome::Ignored(
                "signal from a courier that does not hold the order",
            ));
        }

        let now = self.clock.now();
        match signal {
            CourierSignal::Accept => {
                self.advance(order, OrderStatus::CourierAccepted, courier_id, now)
                    .await
            }
            CourierSignal::Arrived => {
                self.advance(order, OrderStatus::ArrivedPickup, courier_id, now)
                    .await
            }
            CourierSignal::Started => {
                self.advance(order, OrderStatus::InProgress, courier_id, now)
                    .await
            }
            CourierSignal::Delivered => self.complete(order, courier_id, now).await,
            CourierSignal::Refuse => self.refuse(order, courier_id, reason, now).await,
        }
    }

    /// Monotonic forward move. A later-stage signal may skip a missed earlier
    /// one; duplicates and backward signals fall through to `Ignored`.
    async fn advance(
        &self,
        order: Order,
        target: OrderStatus,
        courier_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SignalOutcome, DispatchError> {
        let (Some(current), Some(next)) = (
            order.status.progression_rank(),
            target.progression_rank(),
        ) else {
            return Ok(SignalOutcome::Ignored("signal does not advance the delivery"));
        };
        if next <= current {
            return Ok(SignalOutcome::Ignored("signal does not advance the delivery"));
        }

        let patch = OrderPatch {
            status: target,
            assigned_courier_id: Some(courier_id),
            refusal: None,
            updated_at: now,
        };
        let updated = self
            .orders
            .update_status(order.id, &[order.status], patch)
            .await
            .map_err(|err| Self::order_err(order.id, err))?;

        if order.status == OrderStatus::Offered {
            self.offers.remove(&order.id);
        }

        self.feed.publish(FeedEvent::OrderChanged {
            order: updated.clone(),
        });

        info!(
            order_id = %order.id,
            courier_id = %courier_id,
            from = order.status.as_str(),
            to = target.as_str(),
            "delivery advanced"
        );
        Ok(SignalOutcome::Applied(updated))
    }

    /// Terminal completion. Always clears the assignment and frees the
    /// courier regardless of which intermediate stage was last recorded.
    async fn complete(
        &self,
        order: Order,
        courier_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SignalOutcome, DispatchError> {
        let patch = OrderPatch {
            status: OrderStatus::Delivered,
            assigned_courier_id: None,
            refusal: None,
            updated_at: now,
        };
        let updated = self
            .orders
            .update_status(order.id, &[order.status], patch)
            .await
            .map_err(|err| Self::order_err(order.id, err))?;

        self.offers.remove(&order.id);

        let courier = self
            .couriers
            .update_availability(courier_id, Availability::Online, now)
            .await
            .map_err(|err| Self::courier_err(courier_id, err))?;

        self.feed.publish(FeedEvent::OrderChanged {
            order: updated.clone(),
        });
        self.feed.publish(FeedEvent::CourierChanged { courier });

        info!(
            order_id = %order.id,
            courier_id = %courier_id,
            reference = %updated.reference,
            "delivery completed"
        );
        Ok(SignalOutcome::Applied(updated))
    }

    async fn refuse(
        &self,
        order: Order,
        courier_id: Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<SignalOutcome, DispatchError> {
        if order.status != OrderStatus::Offered {
            return Ok(SignalOutcome::Ignored(
                "refusal is only valid while the offer is outstanding",
            ));
        }

        let record = RefusalRecord {
            order_id: order.id,
            courier_id,
            reason: reason.unwrap_or_else(|| "refused by courier".to_string()),
            refused_at: now,
        };
        self.ledger.append(record.clone());
        let (count, last_refused_by) = self.ledger.count_and_last_refuser(order.id);

        // Release the order before freeing the courier: a failure between the
        // two writes can only strand the courier in the detectable stuck
        // state, never leave the order captured by a courier that rejected it.
        let patch = OrderPatch {
            status: OrderStatus::Refused,
            assigned_courier_id: None,
            refusal: Some((count, last_refused_by)),
            updated_at: now,
        };
        let updated = self
            .orders
            .update_status(order.id, &[OrderStatus::Offered], patch)
            .await
            .map_err(|err| Self::order_err(order.id, err))?;

        self.offers.remove(&order.id);

        let courier = self
            .couriers
            .update_availability(courier_id, Availability::Online, now)
            .await
            .map_err(|err| Self::courier_err(courier_id, err))?;

        self.feed.publish(FeedEvent::OrderRefused { refusal: record });
        self.feed.publish(FeedEvent::OrderChanged {
            order: updated.clone(),
        });
        self.feed.publish(FeedEvent::CourierChanged { courier });

        self.metrics.refusals_total.inc();
        info!(
            order_id = %order.id,
            courier_id = %courier_id,
            refusal_count = count,
            "offer refused"
        );
        Ok(SignalOutcome::Applied(updated))
    }

    /// Operator intervention: returns an assigned order to the dispatch pool
    /// and frees its courier. Also the repair path for stale offers, which
    /// have no timeout of their own.
    pub async fn unassign(&self, order_id: Uuid, reason: String) -> Result<Order, DispatchError> {
        let start = Instant::now();
        let result = self.unassign_inner(order_id, reason).await;
        self.metrics
            .dispatch_latency_seconds
            .with_label_values(&["unassign"])
            .observe(start.elapsed().as_secs_f64());
        result
    }

    async fn unassign_inner(&self, order_id: Uuid, reason: String) -> Result<Order, DispatchError> {
        let _order_guard = self.order_locks.acquire(order_id).await;

        let order = self
            .orders
            .get(order_id)
            .await
            .map_err(|err| Self::order_err(order_id, err))?;

        if !order.status.is_active_assignment() {
            return Err(DispatchError::NotEligible(format!(
                "order is {}",
                order.status.as_str()
            )));
        }
        let courier_id = order.assigned_courier_id.ok_or_else(|| {
            DispatchError::Internal("assigned status without a courier".to_string())
        })?;

        let _courier_guard = self.courier_locks.acquire(courier_id).await;
        let now = self.clock.now();

        let patch = OrderPatch {
            status: OrderStatus::Ready,
            assigned_courier_id: None,
            refusal: None,
            updated_at: now,
        };
        let updated = self
            .orders
            .update_status(order_id, &[order.status], patch)
            .await
            .map_err(|err| Self::order_err(order_id, err))?;

        self.offers.remove(&order_id);

        let courier = self
            .couriers
            .update_availability(courier_id, Availability::Online, now)
            .await
            .map_err(|err| Self::courier_err(courier_id, err))?;

        self.feed.publish(FeedEvent::OrderUnassigned {
            order_id,
            courier_id,
            reason: reason.clone(),
        });
        self.feed.publish(FeedEvent::OrderChanged {
            order: updated.clone(),
        });
        self.feed.publish(FeedEvent::CourierChanged { courier });

        info!(order_id = %order_id, courier_id = %courier_id, reason = %reason, "order unassigned");
        Ok(updated)
    }

    /// Operator cancellation, valid from any non-terminal status. Frees the
    /// courier whenever one is attached, whatever intermediate state the
    /// assignment was in.
    pub async fn cancel(&self, order_id: Uuid, reason: String) -> Result<Order, DispatchError> {
        let start = Instant::now();
        let result = self.cancel_inner(order_id, reason).await;
        self.metrics
            .dispatch_latency_seconds
            .with_label_values(&["cancel"])
            .observe(start.elapsed().as_secs_f64());
        result
    }

    async fn cancel_inner(&self, order_id: Uuid, reason: String) -> Result<Order, DispatchError> {
        let _order_guard = self.order_locks.acquire(order_id).await;

        let order = self
            .orders
            .get(order_id)
            .await
            .map_err(|err| Self::order_err(order_id, err))?;

        if order.status.is_terminal() {
            return Err(DispatchError::NotEligible(format!(
                "order is already {}",
                order.status.as_str()
            )));
        }

        let _courier_guard = match order.assigned_courier_id {
            Some(courier_id) => Some(self.courier_locks.acquire(courier_id).await),
            None => None,
        };
        let now = self.clock.now();

        let patch = OrderPatch {
            status: OrderStatus::Cancelled,
            assigned_courier_id: None,
            refusal: None,
            updated_at: now,
        };
        let updated = self
            .orders
            .update_status(order_id, &[order.status], patch)
            .await
            .map_err(|err| Self::order_err(order_id, err))?;

        self.offers.remove(&order_id);

        if let Some(courier_id) = order.assigned_courier_id {
            let courier = self
                .couriers
                .update_availability(courier_id, Availability::Online, now)
                .await
                .map_err(|err| Self::courier_err(courier_id, err))?;
            self.feed.publish(FeedEvent::CourierChanged { courier });
        }

        self.feed.publish(FeedEvent::OrderCancelled {
            order_id,
            reason: reason.clone(),
        });
        self.feed.publish(FeedEvent::OrderChanged {
            order: updated.clone(),
        });

        info!(order_id = %order_id, reason = %reason, "order cancelled");
        Ok(updated)
    }

    /// Audited escape hatch for the stuck-courier condition (busy with no
    /// active order after a missed or lost signal). Refuses to touch a
    /// courier that genuinely holds work.
    pub async fn force_available(&self, courier_id: Uuid) -> Result<Courier, DispatchError> {
        let _courier_guard = self.courier_locks.acquire(courier_id).await;

        let courier = self
            .couriers
            .get(courier_id)
            .await
            .map_err(|err| Self::courier_err(courier_id, err))?;

        if courier.availability != Availability::Busy {
            return Err(DispatchError::NotEligible(format!(
                "courier is {}",
                courier.availability.as_str()
            )));
        }

        let orders = self
            .orders
            .list()
            .await
            .map_err(|err| DispatchError::Internal(err.to_string()))?;
        let holds_active = orders.iter().any(|order| {
            order.assigned_courier_id == Some(courier_id) && order.status.is_active_assignment()
        });
        if holds_active {
            return Err(DispatchError::NotEligible(
                "courier holds an active assignment; unassign the order instead".to_string(),
            ));
        }

        let courier = self
            .couriers
            .update_availability(courier_id, Availability::Online, self.clock.now())
            .await
            .map_err(|err| Self::courier_err(courier_id, err))?;

        self.feed.publish(FeedEvent::CourierRepaired { courier_id });
        self.feed.publish(FeedEvent::CourierChanged {
            courier: courier.clone(),
        });

        self.metrics.courier_repairs_total.inc();
        warn!(courier_id = %courier_id, "stuck courier force-repaired to online");
        Ok(courier)
    }

    /// Courier going on or off shift. Busy is owned by the coordinator and
    /// can neither be entered nor left through this path.
    pub async fn set_availability(
        &self,
        courier_id: Uuid,
        target: Availability,
    ) -> Result<Courier, DispatchError> {
        if target == Availability::Busy {
            return Err(DispatchError::BadRequest(
                "busy is managed by the dispatcher".to_string(),
            ));
        }

        let _courier_guard = self.courier_locks.acquire(courier_id).await;

        let courier = self
            .couriers
            .get(courier_id)
            .await
            .map_err(|err| Self::courier_err(courier_id, err))?;

        if courier.availability == Availability::Busy {
            return Err(DispatchError::CourierUnavailable);
        }
        if courier.availability == target {
            return Ok(courier);
        }

        let courier = self
            .couriers
            .update_availability(courier_id, target, self.clock.now())
            .await
            .map_err(|err| Self::courier_err(courier_id, err))?;

        self.feed.publish(FeedEvent::CourierChanged {
            courier: courier.clone(),
        });

        info!(courier_id = %courier_id, availability = target.as_str(), "courier availability changed");
        Ok(courier)
    }

    /// Couriers marked busy with no active order. Detection only; the repair
    /// stays an explicit operator action so the audit trail survives.
    pub async fn stuck_couriers(&self) -> Result<Vec<Courier>, DispatchError> {
        let couriers = self
            .couriers
            .list()
            .await
            .map_err(|err| DispatchError::Internal(err.to_string()))?;
        let orders = self
            .orders
            .list()
            .await
            .map_err(|err| DispatchError::Internal(err.to_string()))?;

        let active: HashSet<Uuid> = orders
            .iter()
            .filter(|order| order.status.is_active_assignment())
            .filter_map(|order| order.assigned_courier_id)
            .collect();

        Ok(couriers
            .into_iter()
            .filter(|courier| {
                courier.availability == Availability::Busy && !active.contains(&courier.id)
            })
            .collect())
    }

    fn order_err(id: Uuid, err: StoreError) -> DispatchError {
        match err {
            StoreError::NotFound(_) => DispatchError::OrderNotFound(id),
            StoreError::Conflict { .. } => {
                DispatchError::NotEligible("order status changed concurrently".to_string())
            }
            StoreError::Unavailable(msg) => DispatchError::Internal(msg),
        }
    }

    fn courier_err(id: Uuid, err: StoreError) -> DispatchError {
        match err {
            StoreError::NotFound(_) => DispatchError::CourierNotFound(id),
            StoreError::Conflict { .. } => {
                DispatchError::Internal("unexpected courier status conflict".to_string())
            }
            StoreError::Unavailable(msg) => DispatchError::Internal(msg),
        }
    }
}
