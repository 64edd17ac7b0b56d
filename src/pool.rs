//! Manager pool
//!
//! Process-wide registry of live managers keyed by room id. Holders never
//! call into a manager while the lock is held; `snapshot` hands out a shallow
//! copy so iteration happens lock-free.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::manager::Manager;

#[derive(Default)]
pub struct ManagerPool {
    managers: RwLock<HashMap<i64, Arc<Manager>>>,
}

impl ManagerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, room_id: i64) -> Option<Arc<Manager>> {
        self.managers
            .read()
            .expect("pool lock poisoned")
            .get(&room_id)
            .cloned()
    }

    pub fn contains(&self, room_id: i64) -> bool {
        self.managers
            .read()
            .expect("pool lock poisoned")
            .contains_key(&room_id)
    }

    /// Insert a manager. At most one entry per room id; a replaced manager is
    /// returned so the caller can stop it.
    pub fn add(&self, room_id: i64, manager: Arc<Manager>) -> Option<Arc<Manager>> {
        self.managers
            .write()
            .expect("pool lock poisoned")
            .insert(room_id, manager)
    }

    /// Remove a manager. Idempotent: removing an absent id is a no-op.
    pub fn remove(&self, room_id: i64) {
        self.managers
            .write()
            .expect("pool lock poisoned")
            .remove(&room_id);
    }

    /// Point-in-time shallow copy. Not linearizable with later add/remove.
    pub fn snapshot(&self) -> HashMap<i64, Arc<Manager>> {
        self.managers.read().expect("pool lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.managers.read().expect("pool lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
