//! Application blueprints: an idle container with the workspace mounted,
//! then a source fetch + install step and a launch step run inside it.
//!
//! Both steps are detached. The launch step polls for the marker the
//! dependency step leaves on success, so the two run in order without the
//! pipeline waiting on either. Markers are keyed by deploy, because `/app`
//! outlives the container and still holds the previous deploy's marker.
//!
//! The launched process records its pid in the container's own filesystem.
//! A redeploy's dependency step stops that process before replacing the
//! sources; the pid file is cleared whenever the container starts.

use crate::config::BerthConfig;
use crate::instance::{Payload, ServiceClass};
use crate::request::{NodeApp, PythonApp, PythonVersion, StaticApp};
use crate::runtime::{ContainerSpec, MountSource, MountSpec, PortSpec};

use super::blueprint::{Blueprint, Phase, SetupStep, quote, quote_all};

const WORKSPACE: &str = "/app";
const SOURCE_DIR: &str = "/app/src";
const READY_PREFIX: &str = "/app/.berth-ready-";
const PID_FILE: &str = "/tmp/berth-app.pid";
const STATIC_ROOT: &str = "/usr/share/nginx/html";
// Setup output goes to the container's main log stream.
const LOG_SINK: &str = "/proc/1/fd/1";

pub(crate) const INSTALL_LABEL: &str = "install-deps";
pub(crate) const LAUNCH_LABEL: &str = "launch";

fn app_container(name: &str, image: &str, port: u16, config: &BerthConfig) -> ContainerSpec {
    let mut spec = ContainerSpec::new(name, image);
    spec.mounts.push(MountSpec {
        source: MountSource::Bind(
            config
                .paths
                .workspace_root
                .join(name)
                .to_string_lossy()
                .into_owned(),
        ),
        target: WORKSPACE.into(),
        read_only: false,
    });
    spec.ports.push(PortSpec {
        container_port: port,
        host_port: port,
    });
    spec.limits = config.limits.for_class(ServiceClass::Application);
    spec.working_dir = Some(WORKSPACE.into());
    spec.command = Some(vec![
        "sh".into(),
        "-c".into(),
        format!("rm -f {PID_FILE}; exec tail -f /dev/null"),
    ]);
    spec
}

fn ready_marker(deploy: &str) -> String {
    format!("{READY_PREFIX}{deploy}")
}

fn install_step(url: &str, install: Option<String>, deploy: &str) -> SetupStep {
    let mut script = format!(
        "set -e; \
         if [ -f {PID_FILE} ]; then kill \"$(cat {PID_FILE})\" 2>/dev/null || true; rm -f {PID_FILE}; fi; \
         rm -rf {SOURCE_DIR} {READY_PREFIX}*; git clone --depth 1 {} {SOURCE_DIR}; cd {SOURCE_DIR}",
        quote(url)
    );
    if let Some(install) = install {
        script.push_str("; ");
        script.push_str(&install);
    }
    script.push_str(&format!("; touch {}", ready_marker(deploy)));
    SetupStep::shell(
        INSTALL_LABEL,
        Phase::Dependency,
        format!("{{ {script}; }} &> {LOG_SINK}"),
    )
}

fn launch_step(command: String, deploy: &str) -> SetupStep {
    SetupStep::shell(
        LAUNCH_LABEL,
        Phase::Launch,
        format!(
            "until [ -f {} ]; do sleep 1; done; echo $$ > {PID_FILE}; cd {SOURCE_DIR} && exec {command} &> {LOG_SINK}",
            ready_marker(deploy)
        ),
    )
}

pub(crate) fn python(request: &PythonApp, config: &BerthConfig, deploy: &str) -> Blueprint {
    let image = match request.python_version {
        PythonVersion::Two => &config.images.python2,
        PythonVersion::Three => &config.images.python3,
    };
    let port = request.context.port;
    let mut container = app_container(&request.name, image, port, config);
    container.env = request.env.clone();

    let install = request
        .requirements
        .as_ref()
        .map(|path| format!("pip install -r {}", quote(path)));
    let command = if request.django {
        format!("python manage.py runserver 0.0.0.0:{port}")
    } else {
        let mut command = format!("python {}", quote(&request.context.index));
        if !request.context.args.is_empty() {
            command.push(' ');
            command.push_str(&quote_all(&request.context.args));
        }
        command
    };

    Blueprint {
        container,
        setup: vec![
            install_step(&request.url, install, deploy),
            launch_step(command, deploy),
        ],
        port,
        payload: Payload::App {
            source_url: request.url.clone(),
            env: request.env.clone(),
            build_args: request.requirements.iter().cloned().collect(),
        },
    }
}

pub(crate) fn node(request: &NodeApp, config: &BerthConfig, deploy: &str) -> Blueprint {
    let port = request.context.port;
    let mut container = app_container(&request.name, &config.images.node, port, config);
    container.env = request.env.clone();

    let mut install = "npm install".to_string();
    if !request.build_args.is_empty() {
        install.push(' ');
        install.push_str(&quote_all(&request.build_args));
    }
    let mut command = format!("node {}", quote(&request.context.index));
    if !request.context.args.is_empty() {
        command.push(' ');
        command.push_str(&quote_all(&request.context.args));
    }

    Blueprint {
        container,
        setup: vec![
            install_step(&request.url, Some(install), deploy),
            launch_step(command, deploy),
        ],
        port,
        payload: Payload::App {
            source_url: request.url.clone(),
            env: request.env.clone(),
            build_args: request.build_args.clone(),
        },
    }
}

/// Static sites are served by the image's own web server; the only setup is
/// replacing the document root with the fetched sources.
pub(crate) fn static_site(request: &StaticApp, config: &BerthConfig) -> Blueprint {
    let mut container = ContainerSpec::new(&request.name, &config.images.static_site);
    container.env = request.env.clone();
    container.ports.push(PortSpec {
        container_port: 80,
        host_port: request.port,
    });
    container.limits = config.limits.for_class(ServiceClass::Application);

    let script = format!(
        "{{ set -e; rm -rf {STATIC_ROOT}; git clone --depth 1 {} {STATIC_ROOT}; }} &> {LOG_SINK}",
        quote(&request.url)
    );

    Blueprint {
        container,
        setup: vec![SetupStep::shell("fetch-source", Phase::Dependency, script)],
        port: request.port,
        payload: Payload::App {
            source_url: request.url.clone(),
            env: request.env.clone(),
            build_args: vec![],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{node_request, python_request, test_config};
    use crate::request::ProvisionRequest;

    fn script(step: &SetupStep) -> &str {
        &step.argv[2]
    }

    #[test]
    fn python_installs_then_launches_index() {
        let ProvisionRequest::Python(mut request) = python_request("alpha") else {
            unreachable!()
        };
        request.context.args = vec!["--debug".into()];
        let blueprint = python(&request, &test_config(), "d1");

        assert_eq!(blueprint.port, 8000);
        assert_eq!(blueprint.container.image, "img:v1");
        assert_eq!(blueprint.setup.len(), 2);
        assert_eq!(blueprint.setup[0].phase, Phase::Dependency);
        assert!(script(&blueprint.setup[0]).contains("pip install -r requirements.txt"));
        assert!(script(&blueprint.setup[0]).contains("touch /app/.berth-ready-d1"));
        assert_eq!(blueprint.setup[1].phase, Phase::Launch);
        assert!(script(&blueprint.setup[1]).contains("exec python main.py --debug"));
    }

    #[test]
    fn django_runs_the_dev_server_on_the_app_port() {
        let ProvisionRequest::Python(mut request) = python_request("blog") else {
            unreachable!()
        };
        request.django = true;
        request.python_version = PythonVersion::Two;
        let mut config = test_config();
        config.images.python2 = "python:2.7".into();
        let blueprint = python(&request, &config, "d1");

        assert_eq!(blueprint.container.image, "python:2.7");
        assert!(script(&blueprint.setup[1]).contains("manage.py runserver 0.0.0.0:8000"));
    }

    #[test]
    fn node_passes_build_args_to_npm() {
        let ProvisionRequest::Node(mut request) = node_request("api") else {
            unreachable!()
        };
        request.build_args = vec!["--production".into()];
        let blueprint = node(&request, &test_config(), "d1");
        assert!(script(&blueprint.setup[0]).contains("npm install --production"));
        assert!(script(&blueprint.setup[1]).contains("exec node server.js"));
        assert_eq!(
            blueprint.container.mounts[0].source,
            MountSource::Bind("/var/lib/berth/apps/api".into())
        );
    }

    #[test]
    fn redeploy_waits_for_its_own_marker_and_stops_the_old_process() {
        let ProvisionRequest::Python(request) = python_request("alpha") else {
            unreachable!()
        };
        let first = python(&request, &test_config(), "d1");
        let second = python(&request, &test_config(), "d2");

        let install = script(&second.setup[0]);
        let launch = script(&second.setup[1]);
        // The previous deploy's marker never satisfies the new launch.
        assert!(launch.contains("until [ -f /app/.berth-ready-d2 ]"));
        assert!(!launch.contains("/app/.berth-ready-d1"));
        assert_ne!(script(&first.setup[1]), launch);

        // Stop the old process, then clear every marker, then fetch.
        let kill = install.find("kill").unwrap();
        let clear = install.find("rm -rf /app/src /app/.berth-ready-*").unwrap();
        let clone = install.find("git clone").unwrap();
        let touch = install.find("touch /app/.berth-ready-d2").unwrap();
        assert!(kill < clear && clear < clone && clone < touch);
        assert!(launch.contains("echo $$ > /tmp/berth-app.pid"));

        // A fresh container start forgets the old pid.
        let command = second.container.command.as_ref().unwrap();
        assert!(command[2].starts_with("rm -f /tmp/berth-app.pid"));
    }
}
