//! Durable instance metadata contract.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::instance::{Instance, InstanceFilter, InstancePatch, RecordId, StoredInstance};

pub type StoreResult<T> = Result<T, StoreError>;
pub type DynMetadataStore = Arc<dyn MetadataStore>;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn find(&self, filter: &InstanceFilter) -> StoreResult<Vec<StoredInstance>>;
    async fn insert(&self, instance: &Instance) -> StoreResult<RecordId>;
    /// Apply `patch` to every record matching `filter` as one operation.
    async fn update_many(&self, filter: &InstanceFilter, patch: &InstancePatch)
    -> StoreResult<u64>;
    async fn delete_many(&self, filter: &InstanceFilter) -> StoreResult<u64>;
}
