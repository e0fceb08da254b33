//! Per-key mutual exclusion
//!
//! Passes for the same key queue behind one async mutex; different keys never
//! contend. Entries are dropped once no pass holds or waits for them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Held for the duration of a pass
pub type KeyGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default, Clone)]
pub struct KeyedLock {
    entries: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other holder of `key` remains
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            // The map holds one reference; any other means a holder or waiter
            entries.retain(|k, m| k == key || Arc::strong_count(m) > 1);
            entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }

    /// Whether some pass currently holds `key`
    pub fn is_locked(&self, key: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).is_some_and(|m| m.try_lock().is_err())
    }

    pub fn cluster_key(namespace: &str, name: &str) -> String {
        format!("{}/{}", namespace, name)
    }

    pub fn dbops_key(namespace: &str, cluster: &str) -> String {
        format!("dbops/{}/{}", namespace, cluster)
    }
}
