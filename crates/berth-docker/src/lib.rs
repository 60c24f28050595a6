//! [`ContainerRuntime`] over a local Docker Engine.

mod convert;
mod plugin;

pub use plugin::PluginCli;

use async_trait::async_trait;
use berth_core::error::RuntimeError;
use berth_core::runtime::{
    ContainerId, ContainerRuntime, ContainerSpec, ContainerState, ExecHandle, PluginInstall,
    RuntimeResult,
};
use bollard::Docker;
use bollard::exec::StartExecOptions;
use bollard::models::ExecConfig;
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, InspectContainerOptions, ListContainersOptions,
    ListImagesOptions, RemoveContainerOptions, StartContainerOptions,
};
use futures_util::StreamExt;
use thiserror::Error;
use tracing::{debug, info};

use crate::convert::{create_body, runtime_error};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("cannot reach the docker daemon: {0}")]
    Daemon(#[from] bollard::errors::Error),
}

pub struct DockerRuntime {
    client: Docker,
    plugins: PluginCli,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform's default socket.
    pub fn connect() -> Result<Self, ConnectError> {
        let client = Docker::connect_with_local_defaults()?;
        Ok(Self::with_client(client, PluginCli::default()))
    }

    pub fn with_client(client: Docker, plugins: PluginCli) -> Self {
        Self { client, plugins }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> RuntimeResult<Vec<String>> {
        let opts = ListContainersOptions {
            all: true,
            ..Default::default()
        };
        let containers = self
            .client
            .list_containers(Some(opts))
            .await
            .map_err(|e| runtime_error(e, "list containers"))?;
        Ok(containers
            .into_iter()
            .flat_map(|c| c.names.unwrap_or_default())
            .map(|n| n.trim_start_matches('/').to_string())
            .collect())
    }

    async fn list_images(&self) -> RuntimeResult<Vec<String>> {
        let images = self
            .client
            .list_images(Some(ListImagesOptions::default()))
            .await
            .map_err(|e| runtime_error(e, "list images"))?;
        Ok(images.into_iter().flat_map(|i| i.repo_tags).collect())
    }

    async fn pull_image(&self, reference: &str) -> RuntimeResult<()> {
        info!(image = %reference, "pulling image");
        let opts = CreateImageOptions {
            from_image: Some(reference.to_string()),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(opts), None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| runtime_error(e, &format!("pull {reference}")))?;
        }
        Ok(())
    }

    async fn inspect_container(&self, name: &str) -> RuntimeResult<ContainerState> {
        let details = self
            .client
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| runtime_error(e, &format!("inspect {name}")))?;
        let id = details
            .id
            .ok_or_else(|| RuntimeError::Unavailable(format!("inspect {name}: no container id")))?;
        let running = details
            .state
            .ok_or_else(|| RuntimeError::Unavailable(format!("inspect {name}: no state")))?
            .running
            .unwrap_or(false);
        Ok(ContainerState {
            id: ContainerId::new(id),
            running,
        })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<ContainerId> {
        let opts = CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        };
        let response = self
            .client
            .create_container(Some(opts), create_body(spec))
            .await
            .map_err(|e| runtime_error(e, &format!("create {}", spec.name)))?;
        debug!(name = %spec.name, container = %response.id, "container created");
        Ok(ContainerId::new(response.id))
    }

    async fn start_container(&self, name: &str) -> RuntimeResult<()> {
        self.client
            .start_container(name, None::<StartContainerOptions>)
            .await
            .map_err(|e| runtime_error(e, &format!("start {name}")))
    }

    async fn delete_container(&self, name: &str) -> RuntimeResult<()> {
        let opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.client
            .remove_container(name, Some(opts))
            .await
            .map_err(|e| runtime_error(e, &format!("delete {name}")))
    }

    async fn exec_detached(
        &self,
        container: &ContainerId,
        argv: &[String],
    ) -> RuntimeResult<ExecHandle> {
        let config = ExecConfig {
            cmd: Some(argv.to_vec()),
            attach_stdin: Some(false),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            tty: Some(false),
            ..Default::default()
        };
        let exec = self
            .client
            .create_exec(container.as_str(), config)
            .await
            .map_err(|e| runtime_error(e, &format!("exec in {container}")))?;
        self.client
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| runtime_error(e, &format!("start exec in {container}")))?;
        Ok(ExecHandle(exec.id))
    }

    async fn list_plugins(&self) -> RuntimeResult<Vec<String>> {
        self.plugins.list().await
    }

    async fn install_plugin(&self, opts: &PluginInstall) -> RuntimeResult<()> {
        info!(plugin = %opts.remote, "installing plugin");
        self.plugins.install(opts).await
    }

    async fn is_plugin_enabled(&self, reference: &str) -> RuntimeResult<bool> {
        self.plugins.is_enabled(reference).await
    }

    async fn enable_plugin(&self, reference: &str) -> RuntimeResult<()> {
        self.plugins.enable(reference).await
    }
}
