//! In-process per-lead exclusion.
//!
//! A lease keeps two tasks in this process from working on the same lead at
//! once. It never waits: a busy lead is skipped and picked up on a later
//! tick. The store's version check still guards against anything the lease
//! cannot see.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct LeadLocks {
    held: Arc<Mutex<HashSet<Uuid>>>,
}

impl LeadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lead if nobody else holds it.
    pub fn try_acquire(&self, lead_id: Uuid) -> Option<LeadLease> {
        if self.held().insert(lead_id) {
            Some(LeadLease {
                lead_id,
                held: Arc::clone(&self.held),
            })
        } else {
            None
        }
    }

    pub fn is_held(&self, lead_id: Uuid) -> bool {
        self.held().contains(&lead_id)
    }

    fn held(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Released on drop.
#[derive(Debug)]
pub struct LeadLease {
    lead_id: Uuid,
    held: Arc<Mutex<HashSet<Uuid>>>,
}

impl LeadLease {
    pub fn lead_id(&self) -> Uuid {
        self.lead_id
    }
}

impl Drop for LeadLease {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.lead_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_drop() {
        let locks = LeadLocks::new();
        let id = Uuid::new_v4();

        let lease = locks.try_acquire(id).unwrap();
        assert_eq!(lease.lead_id(), id);
        assert!(locks.try_acquire(id).is_none());
        assert!(locks.is_held(id));

        drop(lease);
        assert!(!locks.is_held(id));
        assert!(locks.try_acquire(id).is_some());
    }

    #[test]
    fn leads_are_independent() {
        let locks = LeadLocks::new();
        let _a = locks.try_acquire(Uuid::new_v4()).unwrap();
        assert!(locks.try_acquire(Uuid::new_v4()).is_some());
    }
}
