use dashmap::DashMap;
use uuid::Uuid;

use crate::models::offer::RefusalRecord;

/// Append-only refusal log keyed by order. Feeds the coordinator's re-offer
/// cooldown and the operator view explaining why an order sits in `refused`.
pub struct RefusalLedger {
    records: DashMap<Uuid, Vec<RefusalRecord>>,
}

impl RefusalLedger {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    pub fn append(&self, record: RefusalRecord) {
        self.records
            .entry(record.order_id)
            .or_default()
            .push(record);
    }

    pub fn count_and_last_refuser(&self, order_id: Uuid) -> (u32, Option<Uuid>) {
        match self.records.get(&order_id) {
            Some(entry) => {
                let records = entry.value();
                (
                    records.len() as u32,
                    records.last().map(|record| record.courier_id),
                )
            }
            None => (0, None),
        }
    }

    pub fn last_record(&self, order_id: Uuid) -> Option<RefusalRecord> {
        self.records
            .get(&order_id)
            .and_then(|entry| entry.value().last().cloned())
    }

    pub fn records(&self, order_id: Uuid) -> Vec<RefusalRecord> {
        self.records
            .get(&order_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}

impl Default for RefusalLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::RefusalLedger;
    use crate::models::offer::RefusalRecord;

    fn record(order_id: Uuid, courier_id: Uuid) -> RefusalRecord {
        RefusalRecord {
            order_id,
            courier_id,
            reason: "refused by courier".to_string(),
            refused_at: Utc::now(),
        }
    }

    #[test]
    fn empty_ledger_has_no_refusals() {
        let ledger = RefusalLedger::new();
        assert_eq!(ledger.count_and_last_refuser(Uuid::new_v4()), (0, None));
    }

    #[test]
    fn counts_and_tracks_latest_refuser() {
        let ledger = RefusalLedger::new();
        let order_id = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        ledger.append(record(order_id, first));
        ledger.append(record(order_id, second));

        assert_eq!(
            ledger.count_and_last_refuser(order_id),
            (2, Some(second))
        );
        assert_eq!(ledger.records(order_id).len(), 2);
    }

    #[test]
    fn orders_are_tracked_independently() {
        let ledger = RefusalLedger::new();
        let courier = Uuid::new_v4();
        let refused_order = Uuid::new_v4();

        ledger.append(record(refused_order, courier));

        assert_eq!(ledger.count_and_last_refuser(Uuid::new_v4()), (0, None));
        assert_eq!(
            ledger.count_and_last_refuser(refused_order),
            (1, Some(courier))
        );
    }
}
