pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::courier::{Availability, Courier};
use crate::models::order::{Order, OrderStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity {0} not found")]
    NotFound(Uuid),

    #[error("status conflict: current status is {}", .found.as_str())]
    Conflict { found: OrderStatus },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Fields the coordinator is allowed to write on an order row. The courier
/// reference is always set explicitly (`None` clears it) so a transition can
/// never leave a dangling assignment behind.
#[derive(Debug, Clone)]
pub struct OrderPatch {
    pub status: OrderStatus,
    pub assigned_courier_id: Option<Uuid>,
    /// `(refusal_count, last_refused_by)`; `None` leaves both untouched.
    pub refusal: Option<(u32, Option<Uuid>)>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Order, StoreError>;

    async fn insert(&self, order: Order) -> Result<(), StoreError>;

    async fn list(&self) -> Result<Vec<Order>, StoreError>;

    /// Conditional update: applies `patch` only while the current status is in
    /// `expected`, otherwise fails with `Conflict` and writes nothing.
    async fn update_status(
        &self,
        id: Uuid,
        expected: &[OrderStatus],
        patch: OrderPatch,
    ) -> Result<Order, StoreError>;
}

#[async_trait]
pub trait CourierStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Courier, StoreError>;

    async fn insert(&self, courier: Courier) -> Result<(), StoreError>;

    async fn list(&self) -> Result<Vec<Courier>, StoreError>;

    async fn update_availability(
        &self,
        id: Uuid,
        availability: Availability,
        updated_at: DateTime<Utc>,
    ) -> Result<Courier, StoreError>;
}
