use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::engine::gate;
use crate::feed::{ChangeFeed, FeedEvent};
use crate::models::order::{Order, OrderStatus};
use crate::observability::metrics::Metrics;
use crate::state::AppState;
use crate::store::OrderStore;

/// The four operator board columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Ready,
    Offered,
    Accepted,
    InProgress,
}

impl Partition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Offered => "offered",
            Self::Accepted => "accepted",
            Self::InProgress => "in_progress",
        }
    }

    /// Column for a status; terminal orders leave the board. Refused orders
    /// sit in the ready column (re-offerable) with their refusal badge.
    pub fn of(status: OrderStatus) -> Option<Self> {
        match status {
            OrderStatus::Ready | OrderStatus::Refused => Some(Self::Ready),
            OrderStatus::Offered => Some(Self::Offered),
            OrderStatus::CourierAccepted | OrderStatus::ArrivedPickup => Some(Self::Accepted),
            OrderStatus::InProgress => Some(Self::InProgress),
            OrderStatus::Delivered | OrderStatus::Cancelled => None,
        }
    }
}

/// Everything a console needs to render one order without further queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardCard {
    pub order_id: Uuid,
    pub reference: String,
    pub status: OrderStatus,
    pub courier_id: Option<Uuid>,
    pub scheduled_pickup_at: Option<DateTime<Utc>>,
    pub gate_opens_at: Option<DateTime<Utc>>,
    pub gate_open: bool,
    pub refusal_count: u32,
    pub last_refused_by: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

impl BoardCard {
    fn from_order(order: &Order, now: DateTime<Utc>) -> Self {
        Self {
            order_id: order.id,
            reference: order.reference.clone(),
            status: order.status,
            courier_id: order.assigned_courier_id,
            scheduled_pickup_at: order.scheduled_pickup_at,
            gate_opens_at: gate::opens_at(order),
            gate_open: gate::is_open(order, now),
            refusal_count: order.refusal_count,
            last_refused_by: order.last_refused_by,
            updated_at: order.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BoardSnapshot {
    pub ready: Vec<BoardCard>,
    pub offered: Vec<BoardCard>,
    pub accepted: Vec<BoardCard>,
    pub in_progress: Vec<BoardCard>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BoardUpdate {
    Snapshot { board: BoardSnapshot },
    Upsert { partition: Partition, card: BoardCard },
    Remove { order_id: Uuid },
}

/// Read-side projection of the dispatch board: a pure fold over the change
/// feed, keyed by order id, idempotent under duplicate and out-of-order
/// delivery. Produces no side effects and can be discarded and rebuilt from
/// a store snapshot at any time.
pub struct Board {
    cards: DashMap<Uuid, BoardCard>,
    updates_tx: broadcast::Sender<BoardUpdate>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl Board {
    pub fn new(buffer: usize, clock: Arc<dyn Clock>, metrics: Metrics) -> Self {
        let (updates_tx, _unused_rx) = broadcast::channel(buffer);
        Self {
            cards: DashMap::new(),
            updates_tx,
            clock,
            metrics,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BoardUpdate> {
        self.updates_tx.subscribe()
    }

    pub fn apply(&self, event: &FeedEvent) {
        match event {
            FeedEvent::OrderChanged { order } => {
                if order.status.is_terminal() {
                    self.remove(order.id);
                } else {
                    self.upsert(order);
                }
            }
            FeedEvent::GateOpened { order_id } => self.gate_opened(*order_id),
            // Courier rows, offers and audit messages carry no board column
            // content of their own; the accompanying OrderChanged does.
            _ => {}
        }
    }

    fn upsert(&self, order: &Order) {
        let Some(partition) = Partition::of(order.status) else {
            return;
        };
        let card = BoardCard::from_order(order, self.clock.now());

        // Event content wins over arrival order: an older row state must
        // never overwrite a newer card.
        let stale = match self.cards.entry(order.id) {
            Entry::Occupied(mut entry) => {
                if entry.get().updated_at > card.updated_at {
                    true
                } else {
                    entry.insert(card.clone());
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(card.clone());
                false
            }
        };
        if stale {
            return;
        }

        let _ = self.updates_tx.send(BoardUpdate::Upsert { partition, card });
        self.refresh_partition_gauges();
    }

    fn remove(&self, order_id: Uuid) {
        if self.cards.remove(&order_id).is_some() {
            let _ = self.updates_tx.send(BoardUpdate::Remove { order_id });
            self.refresh_partition_gauges();
        }
    }

    fn gate_opened(&self, order_id: Uuid) {
        let updated = match self.cards.get_mut(&order_id) {
            Some(mut card) if !card.gate_open => {
                card.gate_open = true;
                Some(card.clone())
            }
            _ => None,
        };

        if let Some(card) = updated {
            if let Some(partition) = Partition::of(card.status) {
                let _ = self.updates_tx.send(BoardUpdate::Upsert { partition, card });
            }
        }
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        let mut ready = Vec::new();
        let mut offered = Vec::new();
        let mut accepted = Vec::new();
        let mut in_progress = Vec::new();

        for entry in self.cards.iter() {
            let card = entry.value().clone();
            match Partition::of(card.status) {
                Some(Partition::Ready) => ready.push(card),
                Some(Partition::Offered) => offered.push(card),
                Some(Partition::Accepted) => accepted.push(card),
                Some(Partition::InProgress) => in_progress.push(card),
                None => {}
            }
        }

        for column in [&mut ready, &mut offered, &mut accepted, &mut in_progress] {
            column.sort_by(|a, b| {
                a.updated_at
                    .cmp(&b.updated_at)
                    .then_with(|| a.reference.cmp(&b.reference))
            });
        }

        BoardSnapshot {
            ready,
            offered,
            accepted,
            in_progress,
        }
    }

    /// Rebuild from a full store snapshot; used on startup and whenever the
    /// feed subscription lagged past the broadcast buffer.
    pub fn resync(&self, orders: Vec<Order>) {
        self.cards.clear();
        let now = self.clock.now();

        for order in &orders {
            if order.status.is_terminal() {
                continue;
            }
            if Partition::of(order.status).is_some() {
                self.cards
                    .insert(order.id, BoardCard::from_order(order, now));
            }
        }

        self.refresh_partition_gauges();
        let _ = self.updates_tx.send(BoardUpdate::Snapshot {
            board: self.snapshot(),
        });
    }

    fn refresh_partition_gauges(&self) {
        let mut counts = [0i64; 4];
        for entry in self.cards.iter() {
            match Partition::of(entry.value().status) {
                Some(Partition::Ready) => counts[0] += 1,
                Some(Partition::Offered) => counts[1] += 1,
                Some(Partition::Accepted) => counts[2] += 1,
                Some(Partition::InProgress) => counts[3] += 1,
                None => {}
            }
        }
        for (partition, count) in [
            Partition::Ready,
            Partition::Offered,
            Partition::Accepted,
            Partition::InProgress,
        ]
        .iter()
        .zip(counts)
        {
            self.metrics
                .board_partition_size
                .with_label_values(&[partition.as_str()])
                .set(count);
        }
    }
}

/// Feed consumer loop. Subscribes first, then seeds from a store snapshot so
/// nothing published in between is lost; the updated_at guard in the fold
/// makes any overlap harmless.
pub async fn run_board_projector(state: Arc<AppState>) {
    info!("board projector started");

    let mut rx = state.feed.subscribe();
    resync_from_store(&state).await;

    loop {
        match rx.recv().await {
            Ok(event) => state.board.apply(&event),
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "board projector lagged; resynchronizing from snapshot");
                resync_from_store(&state).await;
            }
            Err(RecvError::Closed) => break,
        }
    }

    warn!("board projector stopped: feed closed");
}

async fn resync_from_store(state: &AppState) {
    match state.orders.list().await {
        Ok(orders) => state.board.resync(orders),
        Err(err) => error!(error = %err, "board resync failed"),
    }
}
