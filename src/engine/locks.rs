use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Per-entity serialization point. Every write to a given order or courier
/// goes through its mutex; cross-entity operations must acquire order before
/// courier so two coordinator calls can never deadlock against each other.
pub struct LockTable {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    pub async fn acquire(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use uuid::Uuid;

    use super::LockTable;

    #[tokio::test]
    async fn serializes_same_entity() {
        let table = Arc::new(LockTable::new());
        let id = Uuid::new_v4();
        let inside = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = table.clone();
            let inside = inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = table.acquire(id).await;
                let now_inside = inside.fetch_add(1, Ordering::SeqCst);
                assert_eq!(now_inside, 0, "two tasks inside the same entity lock");
                tokio::task::yield_now().await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn different_entities_do_not_block() {
        let table = LockTable::new();
        let _a = table.acquire(Uuid::new_v4()).await;
        let _b = table.acquire(Uuid::new_v4()).await;
    }
}
