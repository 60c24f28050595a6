//! Provisioning and lifecycle engine for the berth control plane.
//!
//! The engine talks to three collaborators through narrow traits: the local
//! container engine ([`ContainerRuntime`]), the durable record of what was
//! provisioned ([`MetadataStore`]) and the routing directory
//! ([`ServiceDirectory`]). [`Pipeline::provision`] and
//! [`StateReconciler::reconcile`] are the two entry points.

pub mod config;
pub mod directory;
pub mod error;
pub mod images;
pub mod instance;
pub mod lifecycle;
pub mod locks;
pub mod pipeline;
pub mod plugin;
pub mod reconciler;
pub mod request;
pub mod runtime;
pub mod store;

#[cfg(any(feature = "test-fixtures", test))]
pub mod fixtures;

pub use config::{BerthConfig, ConfigError};
pub use directory::{DynServiceDirectory, MemDirectory, ServiceDirectory};
pub use error::{DirectoryError, ErrorClass, ProvisionError, RuntimeError, Step, StoreError};
pub use instance::{
    Instance, InstanceFilter, InstancePatch, Kind, Payload, RecordId, ServiceClass, StoredInstance,
};
pub use lifecycle::{EnsureAction, EnsureOutcome, LifecycleManager};
pub use pipeline::{HostReport, InstanceHandle, Pipeline};
pub use plugin::{PluginBootstrap, PluginReport};
pub use reconciler::{HostAddress, ReconcileOutcome, StateReconciler};
pub use request::ProvisionRequest;
pub use runtime::{ContainerId, ContainerRuntime, ContainerSpec, ContainerState, ExecHandle};
pub use store::{DynMetadataStore, MetadataStore};
