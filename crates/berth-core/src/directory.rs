//! Routing and load accounting per service kind.
//!
//! The directory is a cache: losing it loses routing weights only. Identity
//! lives in the metadata store, and the pipeline repopulates entries on every
//! deployment.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::DirectoryError;
use crate::instance::{Kind, StoredInstance};

pub type DirectoryResult<T> = Result<T, DirectoryError>;
pub type DynServiceDirectory = Arc<dyn ServiceDirectory>;

#[async_trait]
pub trait ServiceDirectory: Send + Sync {
    /// Make `address` routable for `service`. Re-registering keeps the current load.
    async fn register(&self, service: Kind, address: &str) -> DirectoryResult<()>;
    async fn increment_load(&self, service: Kind, address: &str) -> DirectoryResult<u64>;
    /// Saturates at zero.
    async fn decrement_load(&self, service: Kind, address: &str) -> DirectoryResult<u64>;
    /// Address with the lowest load; ties go to the lowest address.
    async fn least_loaded(&self, service: Kind) -> DirectoryResult<Option<String>>;
    async fn entries(&self, service: Kind) -> DirectoryResult<Vec<(String, u64)>>;
    /// Move the entry at `from` to `to`, carrying its load over (added to any
    /// load `to` already has). Returns false when `from` was not registered.
    async fn relocate(&self, service: Kind, from: &str, to: &str) -> DirectoryResult<bool>;
}

/// Move the entries of `records` from `previous:port` to their current
/// address. Entries missing under the old address are registered afresh.
/// Failures are logged per record; returns how many records were handled.
pub async fn move_entries(
    directory: &dyn ServiceDirectory,
    records: &[StoredInstance],
    previous: &str,
) -> usize {
    let mut moved = 0;
    for record in records {
        let instance = &record.instance;
        let from = format!("{previous}:{}", instance.port);
        let to = instance.address();
        let result = match directory.relocate(instance.kind, &from, &to).await {
            Ok(true) => Ok(()),
            Ok(false) => directory.register(instance.kind, &to).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => moved += 1,
            Err(err) => {
                warn!(name = %instance.name, from = %from, error = %err, "failed to move directory entry")
            }
        }
    }
    info!(moved, total = records.len(), previous = %previous, "moved directory entries");
    moved
}

/// Process-local directory.
#[derive(Debug, Default)]
pub struct MemDirectory {
    services: RwLock<HashMap<Kind, BTreeMap<String, u64>>>,
}

impl MemDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceDirectory for MemDirectory {
    async fn register(&self, service: Kind, address: &str) -> DirectoryResult<()> {
        let mut services = self.services.write().await;
        services
            .entry(service)
            .or_default()
            .entry(address.to_string())
            .or_insert(0);
        Ok(())
    }

    async fn increment_load(&self, service: Kind, address: &str) -> DirectoryResult<u64> {
        let mut services = self.services.write().await;
        let load = services
            .entry(service)
            .or_default()
            .entry(address.to_string())
            .or_insert(0);
        *load += 1;
        Ok(*load)
    }

    async fn decrement_load(&self, service: Kind, address: &str) -> DirectoryResult<u64> {
        let mut services = self.services.write().await;
        let load = services
            .get_mut(&service)
            .and_then(|entries| entries.get_mut(address))
            .ok_or_else(|| {
                DirectoryError::Backend(format!("{address} is not registered for {service}"))
            })?;
        *load = load.saturating_sub(1);
        Ok(*load)
    }

    async fn least_loaded(&self, service: Kind) -> DirectoryResult<Option<String>> {
        let services = self.services.read().await;
        // BTreeMap iterates by address and min_by_key keeps the first minimum.
        Ok(services.get(&service).and_then(|entries| {
            entries
                .iter()
                .min_by_key(|(_, load)| **load)
                .map(|(addr, _)| addr.clone())
        }))
    }

    async fn entries(&self, service: Kind) -> DirectoryResult<Vec<(String, u64)>> {
        let services = self.services.read().await;
        Ok(services
            .get(&service)
            .map(|entries| entries.iter().map(|(a, l)| (a.clone(), *l)).collect())
            .unwrap_or_default())
    }

    async fn relocate(&self, service: Kind, from: &str, to: &str) -> DirectoryResult<bool> {
        let mut services = self.services.write().await;
        let Some(entries) = services.get_mut(&service) else {
            return Ok(false);
        };
        let Some(load) = entries.remove(from) else {
            return Ok(false);
        };
        *entries.entry(to.to_string()).or_insert(0) += load;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_keeps_existing_load() {
        let dir = MemDirectory::new();
        dir.register(Kind::Static, "10.0.0.5:80").await.unwrap();
        assert_eq!(dir.increment_load(Kind::Static, "10.0.0.5:80").await.unwrap(), 1);
        dir.register(Kind::Static, "10.0.0.5:80").await.unwrap();
        assert_eq!(
            dir.entries(Kind::Static).await.unwrap(),
            vec![("10.0.0.5:80".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn least_loaded_prefers_lower_load_then_address() {
        let dir = MemDirectory::new();
        dir.register(Kind::Python, "10.0.0.7:3000").await.unwrap();
        dir.register(Kind::Python, "10.0.0.6:3000").await.unwrap();
        assert_eq!(
            dir.least_loaded(Kind::Python).await.unwrap().as_deref(),
            Some("10.0.0.6:3000")
        );
        dir.increment_load(Kind::Python, "10.0.0.6:3000").await.unwrap();
        assert_eq!(
            dir.least_loaded(Kind::Python).await.unwrap().as_deref(),
            Some("10.0.0.7:3000")
        );
        assert_eq!(dir.least_loaded(Kind::Node).await.unwrap(), None);
    }

    #[tokio::test]
    async fn decrement_saturates_and_rejects_unknown() {
        let dir = MemDirectory::new();
        dir.register(Kind::Mysql, "10.0.0.5:3306").await.unwrap();
        assert_eq!(dir.decrement_load(Kind::Mysql, "10.0.0.5:3306").await.unwrap(), 0);
        assert!(dir.decrement_load(Kind::Mysql, "10.0.0.9:3306").await.is_err());
    }

    #[tokio::test]
    async fn relocate_moves_the_load_and_drops_the_old_entry() {
        let dir = MemDirectory::new();
        dir.register(Kind::Python, "10.0.0.5:8000").await.unwrap();
        dir.increment_load(Kind::Python, "10.0.0.5:8000").await.unwrap();
        dir.increment_load(Kind::Python, "10.0.0.5:8000").await.unwrap();

        assert!(dir.relocate(Kind::Python, "10.0.0.5:8000", "10.0.0.9:8000").await.unwrap());
        assert_eq!(
            dir.entries(Kind::Python).await.unwrap(),
            vec![("10.0.0.9:8000".to_string(), 2)]
        );
        assert!(!dir.relocate(Kind::Python, "10.0.0.5:8000", "10.0.0.9:8000").await.unwrap());
        assert!(!dir.relocate(Kind::Node, "10.0.0.5:8000", "10.0.0.9:8000").await.unwrap());
    }
}
