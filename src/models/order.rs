use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Ready,
    Offered,
    CourierAccepted,
    ArrivedPickup,
    InProgress,
    Delivered,
    Cancelled,
    Refused,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Offered => "offered",
            Self::CourierAccepted => "courier_accepted",
            Self::ArrivedPickup => "arrived_pickup",
            Self::InProgress => "in_progress",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
            Self::Refused => "refused",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled)
    }

    /// Statuses during which a courier holds the order. The order/courier
    /// invariant ties `assigned_courier_id` to exactly these statuses.
    pub fn is_active_assignment(&self) -> bool {
        matches!(
            self,
            Self::Offered | Self::CourierAccepted | Self::ArrivedPickup | Self::InProgress
        )
    }

    /// Position in the forward delivery progression. Courier signals may only
    /// move an order to a strictly higher rank, never backward.
    pub fn progression_rank(&self) -> Option<u8> {
        match self {
            Self::Offered => Some(1),
            Self::CourierAccepted => Some(2),
            Self::ArrivedPickup => Some(3),
            Self::InProgress => Some(4),
            Self::Delivered => Some(5),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub reference: String,
    pub status: OrderStatus,
    pub pickup_address: String,
    pub delivery_address: String,
    pub price: f64,
    /// Absent for immediate jobs; present for deferred jobs gated on the
    /// 45-minute dispatch window.
    pub scheduled_pickup_at: Option<DateTime<Utc>>,
    pub assigned_courier_id: Option<Uuid>,
    pub refusal_count: u32,
    pub last_refused_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
