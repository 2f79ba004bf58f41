use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One proposal from the coordinator to one courier for one order. At most
/// one outstanding offer exists per order and per courier; the offer is
/// dropped as soon as the courier responds or an operator intervenes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub order_id: Uuid,
    pub courier_id: Uuid,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefusalRecord {
    pub order_id: Uuid,
    pub courier_id: Uuid,
    pub reason: String,
    pub refused_at: DateTime<Utc>,
}

/// Courier-originated lifecycle signals, folded into order state through a
/// single idempotent path (the change feed may redeliver any of them).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CourierSignal {
    Accept,
    Refuse,
    Arrived,
    Started,
    Delivered,
}

impl CourierSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Refuse => "refuse",
            Self::Arrived => "arrived",
            Self::Started => "started",
            Self::Delivered => "delivered",
        }
    }
}
