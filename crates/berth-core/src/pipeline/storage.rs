//! Distributed storage blueprint: the chunk server keeps its data on a volume
//! served by the volume plugin, which must be ready before the container is
//! created.

use crate::config::BerthConfig;
use crate::instance::{Payload, ServiceClass};
use crate::request::StorageRequest;
use crate::runtime::{ContainerSpec, MountSource, MountSpec, PortSpec};

use super::blueprint::Blueprint;

const LIZARDFS_PORT: u16 = 9421;

pub(crate) fn lizardfs(request: &StorageRequest, config: &BerthConfig) -> Blueprint {
    let volume = request
        .volume
        .clone()
        .unwrap_or_else(|| format!("{}-data", request.name));
    let port = request.port.unwrap_or(config.ports.lizardfs);

    let mut container = ContainerSpec::new(&request.name, &config.images.lizardfs);
    container.mounts.push(MountSpec {
        source: MountSource::Volume {
            name: volume.clone(),
            driver: config.plugin.qualified(),
        },
        target: "/mnt/lizardfs".into(),
        read_only: false,
    });
    container.ports.push(PortSpec {
        container_port: LIZARDFS_PORT,
        host_port: port,
    });
    container.limits = config.limits.for_class(ServiceClass::Storage);

    Blueprint {
        container,
        setup: vec![],
        port,
        payload: Payload::Storage { volume },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_is_served_by_the_plugin() {
        let request = StorageRequest {
            name: "chunks".into(),
            port: None,
            volume: None,
        };
        let blueprint = lizardfs(&request, &BerthConfig::default());
        assert_eq!(blueprint.port, 9421);
        assert_eq!(
            blueprint.container.mounts[0].source,
            MountSource::Volume {
                name: "chunks-data".into(),
                driver: "kadimasolutions/lizardfs-volume-plugin:latest".into(),
            }
        );
    }
}
