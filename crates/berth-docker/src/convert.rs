//! Translation between engine-neutral specs and Docker Engine API models.

use std::collections::HashMap;

use berth_core::error::RuntimeError;
use berth_core::runtime::{ContainerSpec, MountSource};
use bollard::errors::Error as BollardError;
use bollard::models::{
    ContainerCreateBody, HostConfig, Mount, MountTypeEnum, MountVolumeOptions,
    MountVolumeOptionsDriverConfig, PortBinding,
};

pub(crate) fn create_body(spec: &ContainerSpec) -> ContainerCreateBody {
    let mut host_config = HostConfig::default();

    if let Some(memory) = spec.limits.memory_bytes {
        host_config.memory = Some(memory as i64);
    }
    if let Some(cpus) = spec.limits.cpus {
        host_config.nano_cpus = Some((cpus * 1_000_000_000.0) as i64);
    }

    let mounts: Vec<Mount> = spec
        .mounts
        .iter()
        .map(|m| match &m.source {
            MountSource::Bind(path) => Mount {
                source: Some(path.clone()),
                target: Some(m.target.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(m.read_only),
                ..Default::default()
            },
            MountSource::Volume { name, driver } => Mount {
                source: Some(name.clone()),
                target: Some(m.target.clone()),
                typ: Some(MountTypeEnum::VOLUME),
                read_only: Some(m.read_only),
                volume_options: Some(MountVolumeOptions {
                    driver_config: Some(MountVolumeOptionsDriverConfig {
                        name: Some(driver.clone()),
                        options: None,
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
        })
        .collect();
    if !mounts.is_empty() {
        host_config.mounts = Some(mounts);
    }

    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    let mut exposed_ports = Vec::new();
    for port in &spec.ports {
        let key = format!("{}/tcp", port.container_port);
        exposed_ports.push(key.clone());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".into()),
                host_port: Some(port.host_port.to_string()),
            }]),
        );
    }
    if !port_bindings.is_empty() {
        host_config.port_bindings = Some(port_bindings);
    }

    let env = spec.env_pairs();
    ContainerCreateBody {
        image: Some(spec.image.clone()),
        env: (!env.is_empty()).then_some(env),
        cmd: spec.command.clone(),
        working_dir: spec.working_dir.clone(),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// Map an engine error, reporting 404 as [`RuntimeError::NotFound`].
pub(crate) fn runtime_error(err: BollardError, what: &str) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(format!("{what}: {message}")),
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } => RuntimeError::Rejected(format!("{what}: {message}")),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } if (400..500).contains(&status_code) => {
            RuntimeError::Rejected(format!("{what}: {message}"))
        }
        other => RuntimeError::Unavailable(format!("{what}: {other}")),
    }
}
