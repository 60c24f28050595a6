//! Keeps stored host addresses in step with this host's network identity.

use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::instance::{InstanceFilter, InstancePatch};
use crate::store::{DynMetadataStore, StoreResult};

/// Shared read handle on the host's last reconciled address.
///
/// Only [`StateReconciler::reconcile`] advances it.
#[derive(Debug, Clone)]
pub struct HostAddress {
    inner: Arc<RwLock<String>>,
}

impl HostAddress {
    fn new(initial: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial.into())),
        }
    }

    pub fn current(&self) -> String {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set(&self, address: &str) {
        let mut current = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *current = address.to_string();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Unchanged,
    Repointed {
        from: String,
        to: String,
        records: u64,
    },
}

pub struct StateReconciler {
    store: DynMetadataStore,
    address: HostAddress,
    // One transition at a time.
    running: Mutex<()>,
}

impl StateReconciler {
    pub fn new(store: DynMetadataStore, initial: impl Into<String>) -> Self {
        Self {
            store,
            address: HostAddress::new(initial),
            running: Mutex::new(()),
        }
    }

    pub fn address(&self) -> HostAddress {
        self.address.clone()
    }

    /// Repoint every record on the cached address to `observed`.
    ///
    /// The cache moves only after the bulk update succeeds, so a failed
    /// attempt is retried in full by the next call.
    pub async fn reconcile(&self, observed: &str) -> StoreResult<ReconcileOutcome> {
        let _running = self.running.lock().await;
        let previous = self.address.current();
        if previous == observed {
            return Ok(ReconcileOutcome::Unchanged);
        }

        info!(from = %previous, to = %observed, "host address changed; repointing records");
        let records = self
            .store
            .update_many(
                &InstanceFilter::on_host(previous.clone()),
                &InstancePatch::host_address(observed),
            )
            .await
            .inspect_err(|err| {
                warn!(from = %previous, to = %observed, error = %err, "repointing failed; will retry");
            })?;

        self.address.set(observed);
        info!(from = %previous, to = %observed, records, "host address reconciled");
        Ok(ReconcileOutcome::Repointed {
            from: previous,
            to: observed.to_string(),
            records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{MemMetadataStore, StoreOp, sample_instance};
    use crate::instance::Kind;
    use crate::store::MetadataStore;

    #[tokio::test]
    async fn same_address_is_a_no_op() {
        let store = Arc::new(MemMetadataStore::new());
        store
            .insert(&sample_instance("alpha", Kind::Python, "10.0.0.5"))
            .await
            .unwrap();
        let reconciler = StateReconciler::new(store.clone(), "10.0.0.5");

        assert_eq!(
            reconciler.reconcile("10.0.0.5").await.unwrap(),
            ReconcileOutcome::Unchanged
        );
        assert_eq!(store.update_calls(), 0);
    }

    #[tokio::test]
    async fn failed_update_keeps_cached_address() {
        let store = Arc::new(MemMetadataStore::new());
        let reconciler = StateReconciler::new(store.clone(), "10.0.0.5");
        store.fail(StoreOp::Update);

        assert!(reconciler.reconcile("10.0.0.9").await.is_err());
        assert_eq!(reconciler.address().current(), "10.0.0.5");
    }
}
