use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::courier::Courier;
use crate::models::offer::{Offer, RefusalRecord};
use crate::models::order::Order;

/// Everything that crosses process boundaries goes through the feed: row
/// mutations carry the full entity so consumers never have to query private
/// state, and ephemeral messages (offers, repairs, gate openings) ride the
/// same stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedEvent {
    OrderChanged { order: Order },
    CourierChanged { courier: Courier },
    OfferIssued { offer: Offer },
    OrderRefused { refusal: RefusalRecord },
    OrderUnassigned { order_id: Uuid, courier_id: Uuid, reason: String },
    OrderCancelled { order_id: Uuid, reason: String },
    GateOpened { order_id: Uuid },
    CourierRepaired { courier_id: Uuid },
}

/// At-least-once event stream. Delivery order is only guaranteed relative to
/// a single entity; consumers must treat redelivery and cross-entity
/// reordering as normal.
pub trait ChangeFeed: Send + Sync {
    fn publish(&self, event: FeedEvent);
    fn subscribe(&self) -> broadcast::Receiver<FeedEvent>;
}

/// In-process feed over a tokio broadcast channel. Slow subscribers lag and
/// must resynchronize from a snapshot, which is exactly the reconnect
/// behavior a networked transport would impose.
pub struct InProcessFeed {
    tx: broadcast::Sender<FeedEvent>,
}

impl InProcessFeed {
    pub fn new(buffer: usize) -> Self {
        let (tx, _unused_rx) = broadcast::channel(buffer);
        Self { tx }
    }
}

impl ChangeFeed for InProcessFeed {
    fn publish(&self, event: FeedEvent) {
        // A send error only means nobody is subscribed right now.
        let _ = self.tx.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.tx.subscribe()
    }
}
