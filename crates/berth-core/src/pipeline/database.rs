//! Database blueprints. The engine's own entrypoint is the server, so there
//! are no setup steps: a running container is a started database.

use crate::config::BerthConfig;
use crate::instance::{Payload, ServiceClass};
use crate::request::DatabaseRequest;
use crate::runtime::{ContainerSpec, MountSource, MountSpec, PortSpec};

use super::blueprint::Blueprint;

const MYSQL_PORT: u16 = 3306;
const MONGODB_PORT: u16 = 27017;

fn database(
    request: &DatabaseRequest,
    config: &BerthConfig,
    image: &str,
    container_port: u16,
    default_host_port: u16,
    data_target: &str,
) -> (ContainerSpec, u16, String) {
    let data_dir = config
        .paths
        .data_root
        .join(&request.name)
        .to_string_lossy()
        .into_owned();
    let port = request.port.unwrap_or(default_host_port);

    let mut spec = ContainerSpec::new(&request.name, image);
    spec.env = request.env.clone();
    spec.mounts.push(MountSpec {
        source: MountSource::Bind(data_dir.clone()),
        target: data_target.into(),
        read_only: false,
    });
    spec.ports.push(PortSpec {
        container_port,
        host_port: port,
    });
    spec.limits = config.limits.for_class(ServiceClass::Database);
    (spec, port, data_dir)
}

pub(crate) fn mysql(request: &DatabaseRequest, config: &BerthConfig) -> Blueprint {
    let (mut container, port, data_dir) = database(
        request,
        config,
        &config.images.mysql,
        MYSQL_PORT,
        config.ports.mysql,
        "/var/lib/mysql",
    );
    container.env.insert(
        "MYSQL_ROOT_PASSWORD".into(),
        config.databases.mysql_root_password.clone(),
    );
    Blueprint {
        container,
        setup: vec![],
        port,
        payload: Payload::Database { data_dir },
    }
}

pub(crate) fn mongodb(request: &DatabaseRequest, config: &BerthConfig) -> Blueprint {
    let (mut container, port, data_dir) = database(
        request,
        config,
        &config.images.mongodb,
        MONGODB_PORT,
        config.ports.mongodb,
        "/data/db",
    );
    container.env.insert(
        "MONGO_INITDB_ROOT_USERNAME".into(),
        config.databases.mongodb_root_user.clone(),
    );
    container.env.insert(
        "MONGO_INITDB_ROOT_PASSWORD".into(),
        config.databases.mongodb_root_password.clone(),
    );
    Blueprint {
        container,
        setup: vec![],
        port,
        payload: Payload::Database { data_dir },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn request(port: Option<u16>) -> DatabaseRequest {
        DatabaseRequest {
            name: "orders".into(),
            port,
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn mysql_defaults_to_configured_port_and_credentials() {
        let mut config = BerthConfig::default();
        config.databases.mysql_root_password = "s3cret".into();
        let blueprint = mysql(&request(None), &config);

        assert_eq!(blueprint.port, 3306);
        assert!(blueprint.setup.is_empty());
        assert_eq!(
            blueprint.container.env.get("MYSQL_ROOT_PASSWORD").map(String::as_str),
            Some("s3cret")
        );
        assert_eq!(
            blueprint.payload,
            Payload::Database {
                data_dir: "/var/lib/berth/data/orders".into()
            }
        );
    }

    #[test]
    fn mongodb_honours_requested_host_port() {
        let blueprint = mongodb(&request(Some(28000)), &BerthConfig::default());
        assert_eq!(blueprint.port, 28000);
        assert_eq!(
            blueprint.container.ports,
            vec![PortSpec {
                container_port: 27017,
                host_port: 28000
            }]
        );
        assert_eq!(blueprint.container.mounts[0].target, "/data/db");
    }
}
