//! Name-keyed mutual exclusion.
//!
//! Operations on the same service name are serialized; different names never
//! contend. Entries are dropped once no task holds or waits on them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct NameLocks {
    table: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

/// Held while a name is locked.
#[derive(Debug)]
pub struct NameGuard {
    _guard: OwnedMutexGuard<()>,
}

impl NameLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, name: &str) -> NameGuard {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table.retain(|_, weak| weak.strong_count() > 0);
            match table.get(name).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(AsyncMutex::new(()));
                    table.insert(name.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        NameGuard {
            _guard: lock.lock_owned().await,
        }
    }

    /// Names currently held or awaited.
    pub fn active(&self) -> usize {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.values().filter(|weak| weak.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_name_is_serialized() {
        let locks = Arc::new(NameLocks::new());
        let guard = locks.acquire("alpha").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire("alpha").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn different_names_do_not_contend() {
        let locks = NameLocks::new();
        let _alpha = locks.acquire("alpha").await;
        let beta = tokio::time::timeout(Duration::from_millis(50), locks.acquire("beta")).await;
        assert!(beta.is_ok());
        assert_eq!(locks.active(), 2);
    }
}
