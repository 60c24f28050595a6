//! Turns a validated request into a running, recorded and routable instance.
//!
//! Steps run strictly in order and stop at the first failure:
//! validate, image, plugin (storage only), container, setup, persist, publish.
//! Nothing is written to the metadata store before the container is running
//! and its setup commands were accepted. Failures after that point leave the
//! container running and are reported as [`ProvisionError::PersistenceFailed`].

mod app;
mod blueprint;
mod database;
mod storage;

pub use blueprint::{Blueprint, Phase, SetupStep};

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::config::BerthConfig;
use crate::directory::{DynServiceDirectory, move_entries};
use crate::error::{PersistStage, ProvisionError, RuntimeError, Step};
use crate::images::{ImageManager, ImageStatus};
use crate::instance::{
    Instance, InstanceFilter, InstancePatch, Kind, RecordId, ServiceClass, StoredInstance,
    unix_now,
};
use crate::lifecycle::{EnsureAction, LifecycleManager};
use crate::locks::NameLocks;
use crate::plugin::{PluginBootstrap, PluginReport};
use crate::reconciler::HostAddress;
use crate::request::ProvisionRequest;
use crate::runtime::{ContainerId, ContainerRuntime, ContainerSpec, RuntimeResult, with_deadline};
use crate::store::{DynMetadataStore, StoreResult};

/// Identity of a provisioned instance, returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    pub id: RecordId,
    pub name: String,
    pub kind: Kind,
    pub container_id: ContainerId,
    /// `host:port` the instance was published under.
    pub address: String,
    pub action: EnsureAction,
}

/// Result of preparing the host at startup. Nothing in here is fatal.
#[derive(Debug)]
pub struct HostReport {
    pub images: Vec<(String, RuntimeResult<ImageStatus>)>,
    pub plugin: Result<PluginReport, ProvisionError>,
}

pub struct Pipeline {
    runtime: Arc<dyn ContainerRuntime>,
    lifecycle: LifecycleManager,
    images: ImageManager,
    plugin: PluginBootstrap,
    store: DynMetadataStore,
    directory: DynServiceDirectory,
    host: HostAddress,
    config: Arc<BerthConfig>,
    // Held for a whole provisioning run, so two requests for one name never interleave.
    locks: NameLocks,
}

impl Pipeline {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: DynMetadataStore,
        directory: DynServiceDirectory,
        host: HostAddress,
        config: Arc<BerthConfig>,
    ) -> Self {
        let deadline = config.deadlines.runtime();
        Self {
            lifecycle: LifecycleManager::new(runtime.clone(), deadline),
            images: ImageManager::new(runtime.clone(), deadline, config.deadlines.pull()),
            plugin: PluginBootstrap::new(runtime.clone(), deadline),
            runtime,
            store,
            directory,
            host,
            config,
            locks: NameLocks::new(),
        }
    }

    pub fn config(&self) -> &BerthConfig {
        &self.config
    }

    pub async fn provision(
        &self,
        request: ProvisionRequest,
    ) -> Result<InstanceHandle, ProvisionError> {
        request.validate()?;
        let name = request.name().to_string();
        let kind = request.kind();
        let _guard = self.locks.acquire(&name).await;

        let host = self.host.current();
        let existing = self.existing_record(&name, kind, &host).await?;
        let blueprint = Blueprint::for_request(&request, &self.config, &deploy_token());
        debug!(name = %name, kind = %kind, image = %blueprint.container.image, "provisioning");

        self.images
            .ensure(&blueprint.container.image)
            .await
            .map_err(|e| ProvisionError::runtime(Step::Image, e))?;

        if kind.class() == ServiceClass::Storage {
            self.plugin.ensure_ready(&self.config.plugin).await?;
        }

        let spec = &blueprint.container;
        let outcome = self
            .lifecycle
            .ensure_running(&name, || self.create_and_start(spec))
            .await
            .map_err(|e| ProvisionError::runtime(Step::Container, e))?;

        for step in &blueprint.setup {
            self.run_step(&name, &outcome.container_id, step).await?;
        }

        let instance = Instance {
            name: name.clone(),
            class: kind.class(),
            kind,
            container_id: outcome.container_id.to_string(),
            host_address: host,
            port: blueprint.port,
            created_at: unix_now(),
            payload: blueprint.payload,
        };
        let id = self.persist(existing, &instance).await?;
        let address = instance.address();
        self.publish(&instance, &address).await?;

        info!(
            name = %name,
            kind = %kind,
            container = %outcome.container_id,
            address = %address,
            action = ?outcome.action,
            "instance provisioned"
        );
        Ok(InstanceHandle {
            id,
            name,
            kind,
            container_id: outcome.container_id,
            address,
            action: outcome.action,
        })
    }

    /// Stored instances matching `filter`.
    pub async fn instances(&self, filter: &InstanceFilter) -> StoreResult<Vec<StoredInstance>> {
        self.store.find(filter).await
    }

    /// Register every instance recorded for this host with the directory.
    ///
    /// Used after a restart, when the directory may have lost its entries.
    /// Loads are left as the directory has them. Returns how many were registered.
    pub async fn republish(&self) -> StoreResult<usize> {
        let host = self.host.current();
        let records = self.store.find(&InstanceFilter::on_host(host)).await?;
        let mut registered = 0;
        for record in &records {
            let instance = &record.instance;
            match self
                .directory
                .register(instance.kind, &instance.address())
                .await
            {
                Ok(()) => registered += 1,
                Err(err) => {
                    warn!(name = %instance.name, error = %err, "failed to republish instance")
                }
            }
        }
        info!(registered, total = records.len(), "republished instances");
        Ok(registered)
    }

    /// Move this host's directory entries from `previous` to the current
    /// address after the records were repointed. Entries missing under the old
    /// address are registered afresh. Returns how many records were handled.
    pub async fn move_published(&self, previous: &str) -> StoreResult<usize> {
        let host = self.host.current();
        let records = self.store.find(&InstanceFilter::on_host(host)).await?;
        Ok(move_entries(self.directory.as_ref(), &records, previous).await)
    }

    /// Pull every configured image and make the volume plugin ready.
    pub async fn prepare_host(&self) -> HostReport {
        let images = self.images.ensure_all(&self.config.images.all()).await;
        let plugin = self.plugin.ensure_ready(&self.config.plugin).await;
        if let Err(err) = &plugin {
            warn!(error = %err, "volume plugin not ready; storage provisioning will retry it");
        }
        HostReport { images, plugin }
    }

    async fn existing_record(
        &self,
        name: &str,
        kind: Kind,
        host: &str,
    ) -> Result<Option<StoredInstance>, ProvisionError> {
        let records = self
            .store
            .find(&InstanceFilter::named(name))
            .await
            .map_err(|source| ProvisionError::MetadataUnavailable {
                name: name.to_string(),
                source,
            })?;

        // Only a record of the same kind on this host can be redeployed.
        if let Some(other) = records
            .iter()
            .find(|r| r.instance.kind != kind || r.instance.host_address != host)
        {
            return Err(ProvisionError::ResourceConflict {
                name: name.to_string(),
                existing_kind: other.instance.kind,
                existing_class: other.instance.class,
                existing_host: other.instance.host_address.clone(),
                requested: kind,
            });
        }
        Ok(records.into_iter().next())
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> RuntimeResult<ContainerId> {
        let id = self.runtime.create_container(spec).await?;
        self.runtime.start_container(&spec.name).await?;
        Ok(id)
    }

    async fn run_step(
        &self,
        name: &str,
        container: &ContainerId,
        step: &SetupStep,
    ) -> Result<(), ProvisionError> {
        let deadline = self.config.deadlines.runtime();
        let handle = with_deadline(
            deadline,
            "exec",
            self.runtime.exec_detached(container, &step.argv),
        )
        .await
        .map_err(|source| setup_failure(name, step, source))?;
        debug!(name = %name, step = %step.label, exec = %handle.0, "setup step started");
        Ok(())
    }

    async fn persist(
        &self,
        existing: Option<StoredInstance>,
        instance: &Instance,
    ) -> Result<RecordId, ProvisionError> {
        let failed = |reason: String| ProvisionError::PersistenceFailed {
            name: instance.name.clone(),
            container_id: instance.container_id.clone(),
            stage: PersistStage::Metadata,
            reason,
        };

        match existing {
            // Redeploy: refresh the record in place. The host address stays
            // with the reconciler.
            Some(record) => {
                let patch = InstancePatch {
                    container_id: Some(instance.container_id.clone()),
                    host_address: None,
                    port: Some(instance.port),
                    payload: Some(instance.payload.clone()),
                };
                let mut filter = InstanceFilter::named(&instance.name).with_kind(instance.kind);
                filter.host_address = Some(instance.host_address.clone());
                let changed = self
                    .store
                    .update_many(&filter, &patch)
                    .await
                    .map_err(|e| failed(e.to_string()))?;
                if changed == 0 {
                    return Err(failed(format!(
                        "record {} is no longer on {}",
                        record.id, instance.host_address
                    )));
                }
                Ok(record.id)
            }
            None => self
                .store
                .insert(instance)
                .await
                .map_err(|e| failed(e.to_string())),
        }
    }

    async fn publish(&self, instance: &Instance, address: &str) -> Result<(), ProvisionError> {
        let failed = |reason: String| ProvisionError::PersistenceFailed {
            name: instance.name.clone(),
            container_id: instance.container_id.clone(),
            stage: PersistStage::Directory,
            reason,
        };
        self.directory
            .register(instance.kind, address)
            .await
            .map_err(|e| failed(e.to_string()))?;
        self.directory
            .increment_load(instance.kind, address)
            .await
            .map_err(|e| failed(e.to_string()))?;
        Ok(())
    }
}

/// Distinct per provisioning run of a name; runs for one name never overlap.
fn deploy_token() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
        .to_string()
}

fn setup_failure(name: &str, step: &SetupStep, source: RuntimeError) -> ProvisionError {
    let name = name.to_string();
    let label = step.label.clone();
    match step.phase {
        Phase::Dependency => ProvisionError::DependencyInstallFailed {
            name,
            label,
            source,
        },
        Phase::Launch => ProvisionError::LaunchFailed {
            name,
            label,
            source,
        },
    }
}

#[cfg(test)]
mod tests;
