use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::models::courier::{Availability, Courier};
use crate::models::order::{Order, OrderStatus};
use crate::store::{CourierStore, OrderPatch, OrderStore, StoreError};

/// DashMap-backed order store. This is what the binary wires up; a persistent
/// backend plugs in behind the same trait.
#[derive(Default)]
pub struct InMemoryOrderStore {
    orders: DashMap<Uuid, Order>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn get(&self, id: Uuid) -> Result<Order, StoreError> {
        self.orders
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn insert(&self, order: Order) -> Result<(), StoreError> {
        self.orders.insert(order.id, order);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Order>, StoreError> {
        Ok(self
            .orders
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected: &[OrderStatus],
        patch: OrderPatch,
    ) -> Result<Order, StoreError> {
        let mut order = self.orders.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if !expected.contains(&order.status) {
            return Err(StoreError::Conflict {
                found: order.status,
            });
        }

        order.status = patch.status;
        order.assigned_courier_id = patch.assigned_courier_id;
        if let Some((count, last_refused_by)) = patch.refusal {
            order.refusal_count = count;
            order.last_refused_by = last_refused_by;
        }
        order.updated_at = patch.updated_at;

        Ok(order.clone())
    }
}

#[derive(Default)]
pub struct InMemoryCourierStore {
    couriers: DashMap<Uuid, Courier>,
}

impl InMemoryCourierStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CourierStore for InMemoryCourierStore {
    async fn get(&self, id: Uuid) -> Result<Courier, StoreError> {
        self.couriers
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn insert(&self, courier: Courier) -> Result<(), StoreError> {
        self.couriers.insert(courier.id, courier);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Courier>, StoreError> {
        Ok(self
            .couriers
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn update_availability(
        &self,
        id: Uuid,
        availability: Availability,
        updated_at: DateTime<Utc>,
    ) -> Result<Courier, StoreError> {
        let mut courier = self.couriers.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        courier.availability = availability;
        courier.updated_at = updated_at;

        Ok(courier.clone())
    }
}
