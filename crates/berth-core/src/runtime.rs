//! Contract for the local container engine.
//!
//! Adapters expose raw engine operations only; every policy decision
//! (recreate, restart, pull) lives in the lifecycle manager and pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use crate::error::RuntimeError;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier of a detached in-container process.
///
/// Holding one means the engine accepted the command; it says nothing about
/// whether the process is still alive or exited cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecHandle(pub String);

/// Observed state of an existing container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub id: ContainerId,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    /// Host directory bind mount.
    Bind(String),
    /// Named volume served by a volume driver plugin.
    Volume { name: String, driver: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: MountSource,
    pub target: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSpec {
    pub container_port: u16,
    pub host_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceLimits {
    pub memory_bytes: Option<u64>,
    pub cpus: Option<f64>,
}

/// Everything an adapter needs to create a container for one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<MountSpec>,
    pub ports: Vec<PortSpec>,
    pub limits: ResourceLimits,
    pub working_dir: Option<String>,
    /// Overrides the image command; `None` keeps the image default.
    pub command: Option<Vec<String>>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            env: BTreeMap::new(),
            mounts: Vec::new(),
            ports: Vec::new(),
            limits: ResourceLimits::default(),
            working_dir: None,
            command: None,
        }
    }

    /// `KEY=value` pairs in key order.
    pub fn env_pairs(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

/// Options for installing a managed engine plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInstall {
    pub remote: String,
    pub args: Vec<String>,
    pub grant_all_permissions: bool,
    pub disabled: bool,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Names of all containers on this host, running or not.
    async fn list_containers(&self) -> RuntimeResult<Vec<String>>;
    /// Repository tags of all local images.
    async fn list_images(&self) -> RuntimeResult<Vec<String>>;
    async fn pull_image(&self, reference: &str) -> RuntimeResult<()>;
    async fn inspect_container(&self, name: &str) -> RuntimeResult<ContainerState>;
    /// Create (not start) a container from `spec`.
    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<ContainerId>;
    async fn start_container(&self, name: &str) -> RuntimeResult<()>;
    /// Force-remove a container, running or not.
    async fn delete_container(&self, name: &str) -> RuntimeResult<()>;
    /// Start `argv` inside the container and return without waiting for it.
    async fn exec_detached(&self, container: &ContainerId, argv: &[String])
    -> RuntimeResult<ExecHandle>;
    /// Installed plugins as `name:tag`.
    async fn list_plugins(&self) -> RuntimeResult<Vec<String>>;
    async fn install_plugin(&self, opts: &PluginInstall) -> RuntimeResult<()>;
    async fn is_plugin_enabled(&self, reference: &str) -> RuntimeResult<bool>;
    async fn enable_plugin(&self, reference: &str) -> RuntimeResult<()>;
}

/// Bound a runtime call so a hung engine cannot stall the caller.
pub async fn with_deadline<T, F>(limit: Duration, op: &'static str, fut: F) -> RuntimeResult<T>
where
    F: Future<Output = RuntimeResult<T>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RuntimeError::Timeout { op, after: limit }),
    }
}
