//! Per-lead mutual exclusion
//!
//! Every lead mutation, AI merge or operator edit, runs while holding the
//! lead's mutex. Entries are weak so idle leads cost nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

type Slot = AsyncMutex<()>;

#[derive(Clone)]
pub struct LeadLocks {
    slots: Arc<Mutex<HashMap<Uuid, Weak<Slot>>>>,
    timeout: Duration,
    attempts: u32,
}

impl LeadLocks {
    pub fn new(timeout: Duration, attempts: u32) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            timeout,
            attempts: attempts.max(1),
        }
    }

    fn slot(&self, lead_id: Uuid) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get(&lead_id).and_then(Weak::upgrade) {
            return slot;
        }
        slots.retain(|_, slot| slot.strong_count() > 0);
        let slot = Arc::new(AsyncMutex::new(()));
        slots.insert(lead_id, Arc::downgrade(&slot));
        slot
    }

    /// Wait for the lead's lock, giving up with `ConcurrentMergeConflict`
    /// after the configured number of timed attempts.
    pub async fn acquire(&self, lead_id: Uuid) -> Result<OwnedMutexGuard<()>> {
        let slot = self.slot(lead_id);
        for attempt in 1..=self.attempts {
            match tokio::time::timeout(self.timeout, slot.clone().lock_owned()).await {
                Ok(guard) => return Ok(guard),
                Err(_) => debug!(
                    "Lead {} is locked (attempt {}/{})",
                    lead_id, attempt, self.attempts
                ),
            }
        }
        Err(Error::ConcurrentMergeConflict(lead_id))
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_same_lead_is_exclusive() {
        let locks = LeadLocks::new(Duration::from_millis(20), 2);
        let lead = Uuid::new_v4();

        let held = locks.acquire(lead).await.unwrap();
        let err = locks.acquire(lead).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrentMergeConflict(id) if id == lead));

        drop(held);
        assert_ok!(locks.acquire(lead).await);
    }

    #[tokio::test]
    async fn test_different_leads_do_not_block() {
        let locks = LeadLocks::new(Duration::from_millis(20), 1);
        let _first = assert_ok!(locks.acquire(Uuid::new_v4()).await);
        let _second = assert_ok!(locks.acquire(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn test_idle_slots_are_reclaimed() {
        let locks = LeadLocks::new(Duration::from_millis(20), 1);
        for _ in 0..10 {
            let guard = locks.acquire(Uuid::new_v4()).await.unwrap();
            drop(guard);
        }
        let _guard = locks.acquire(Uuid::new_v4()).await.unwrap();
        assert_eq!(locks.tracked(), 1);
    }
}
