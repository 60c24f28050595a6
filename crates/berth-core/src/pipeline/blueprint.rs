//! What a request turns into on the engine: one container plus the ordered
//! commands to run inside it once it is up.

use crate::config::BerthConfig;
use crate::instance::Payload;
use crate::request::ProvisionRequest;
use crate::runtime::ContainerSpec;

use super::{app, database, storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Fetch sources and install declared dependencies.
    Dependency,
    /// Start the long-running process.
    Launch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupStep {
    pub label: String,
    pub phase: Phase,
    pub argv: Vec<String>,
}

impl SetupStep {
    pub fn shell(label: &str, phase: Phase, script: String) -> Self {
        Self {
            label: label.to_string(),
            phase,
            argv: vec!["bash".into(), "-c".into(), script],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Blueprint {
    pub container: ContainerSpec,
    pub setup: Vec<SetupStep>,
    /// Host port the instance is published on.
    pub port: u16,
    pub payload: Payload,
}

impl Blueprint {
    /// `deploy` names this provisioning run; setup steps of one run only
    /// wait on each other, never on an earlier run's leftovers.
    pub fn for_request(request: &ProvisionRequest, config: &BerthConfig, deploy: &str) -> Self {
        match request {
            ProvisionRequest::Python(r) => app::python(r, config, deploy),
            ProvisionRequest::Node(r) => app::node(r, config, deploy),
            ProvisionRequest::Static(r) => app::static_site(r, config),
            ProvisionRequest::Mysql(r) => database::mysql(r, config),
            ProvisionRequest::Mongodb(r) => database::mongodb(r, config),
            ProvisionRequest::Lizardfs(r) => storage::lizardfs(r, config),
        }
    }
}

/// Single-quote `arg` for `bash -c`.
pub(crate) fn quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

pub(crate) fn quote_all<'a>(args: impl IntoIterator<Item = &'a String>) -> String {
    args.into_iter()
        .map(|a| quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}
