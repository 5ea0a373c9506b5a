//! Named async locks, created on first use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub(crate) struct LockMap {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LockMap {
    /// Wait for the lock named `key`. The map itself is only held while the
    /// entry is looked up, never across the await.
    pub(crate) async fn acquire(&self, key: String) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(key).or_default())
        };
        lock.lock_owned().await
    }

    pub(crate) fn forget(&self, keys: impl IntoIterator<Item = String>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        for key in keys {
            locks.remove(&key);
        }
    }

    /// Drop every lock nobody holds or waits on. The map keeps the only
    /// reference to such a lock, and new clones are taken under the map lock.
    pub(crate) fn forget_idle(&self) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
