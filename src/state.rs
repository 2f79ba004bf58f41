use std::sync::Arc;

use chrono::Duration;

use crate::board::Board;
use crate::clock::Clock;
use crate::engine::coordinator::Coordinator;
use crate::engine::refusals::RefusalLedger;
use crate::feed::{ChangeFeed, InProcessFeed};
use crate::observability::metrics::Metrics;
use crate::store::memory::{InMemoryCourierStore, InMemoryOrderStore};
use crate::store::{CourierStore, OrderStore};

pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub board: Arc<Board>,
    pub orders: Arc<dyn OrderStore>,
    pub couriers: Arc<dyn CourierStore>,
    pub feed: Arc<dyn ChangeFeed>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(
        event_buffer_size: usize,
        refusal_cooldown_secs: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let metrics = Metrics::new();
        let orders: Arc<dyn OrderStore> = Arc::new(InMemoryOrderStore::new());
        let couriers: Arc<dyn CourierStore> = Arc::new(InMemoryCourierStore::new());
        let feed: Arc<dyn ChangeFeed> = Arc::new(InProcessFeed::new(event_buffer_size));
        let ledger = Arc::new(RefusalLedger::new());

        let coordinator = Arc::new(Coordinator::new(
            orders.clone(),
            couriers.clone(),
            ledger,
            feed.clone(),
            clock.clone(),
            Duration::seconds(refusal_cooldown_secs as i64),
            metrics.clone(),
        ));
        let board = Arc::new(Board::new(
            event_buffer_size,
            clock.clone(),
            metrics.clone(),
        ));

        Self {
            coordinator,
            board,
            orders,
            couriers,
            feed,
            clock,
            metrics,
        }
    }
}
