//! Scriptable in-memory container engine.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::RuntimeError;
use crate::runtime::{
    ContainerId, ContainerRuntime, ContainerSpec, ContainerState, ExecHandle, PluginInstall,
    RuntimeResult,
};

/// One engine call, in the order it was issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    ListContainers,
    ListImages,
    Pull(String),
    Inspect(String),
    Create(String),
    Start(String),
    Delete(String),
    Exec { container: String, argv: Vec<String> },
    ListPlugins,
    InstallPlugin(String),
    PluginEnabled(String),
    EnablePlugin(String),
}

/// Calls that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    ListContainers,
    ListImages,
    Pull,
    Inspect,
    Create,
    Start,
    Delete,
    Exec,
    ListPlugins,
    InstallPlugin,
    PluginEnabled,
    EnablePlugin,
}

#[derive(Debug, Clone)]
struct MockContainer {
    id: String,
    running: bool,
    corrupt: bool,
    spec: Option<ContainerSpec>,
}

#[derive(Debug, Default)]
struct MockState {
    containers: BTreeMap<String, MockContainer>,
    images: BTreeSet<String>,
    plugins: BTreeMap<String, bool>,
    calls: Vec<RuntimeCall>,
    failing: HashSet<FailPoint>,
    exec_budget: Option<usize>,
    latency: Duration,
    next_id: u64,
}

#[derive(Debug, Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

fn qualify(reference: &str) -> String {
    let last = reference.rsplit('/').next().unwrap_or(reference);
    if last.contains(':') {
        reference.to_string()
    } else {
        format!("{reference}:latest")
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    fn allocate_id(state: &mut MockState) -> String {
        state.next_id += 1;
        format!("c-{:04}", state.next_id)
    }

    pub fn add_container(&self, name: &str, running: bool) {
        self.with_state(|s| {
            let id = Self::allocate_id(s);
            s.containers.insert(
                name.to_string(),
                MockContainer {
                    id,
                    running,
                    corrupt: false,
                    spec: None,
                },
            );
        });
    }

    /// A container whose state cannot be inspected.
    pub fn add_corrupt_container(&self, name: &str) {
        self.with_state(|s| {
            let id = Self::allocate_id(s);
            s.containers.insert(
                name.to_string(),
                MockContainer {
                    id,
                    running: false,
                    corrupt: true,
                    spec: None,
                },
            );
        });
    }

    pub fn add_image(&self, tag: &str) {
        self.with_state(|s| {
            s.images.insert(tag.to_string());
        });
    }

    pub fn add_plugin(&self, qualified: &str, enabled: bool) {
        self.with_state(|s| {
            s.plugins.insert(qualified.to_string(), enabled);
        });
    }

    pub fn fail(&self, point: FailPoint) {
        self.with_state(|s| {
            s.failing.insert(point);
        });
    }

    pub fn heal(&self, point: FailPoint) {
        self.with_state(|s| {
            s.failing.remove(&point);
        });
    }

    /// Let the next `n` execs succeed and fail every one after.
    pub fn fail_exec_after(&self, n: usize) {
        self.with_state(|s| s.exec_budget = Some(n));
    }

    /// Delay applied to every call.
    pub fn set_latency(&self, latency: Duration) {
        self.with_state(|s| s.latency = latency);
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn calls_matching(&self, pred: impl Fn(&RuntimeCall) -> bool) -> Vec<RuntimeCall> {
        self.with_state(|s| s.calls.iter().filter(|c| pred(c)).cloned().collect())
    }

    pub fn count(&self, pred: impl Fn(&RuntimeCall) -> bool) -> usize {
        self.with_state(|s| s.calls.iter().filter(|c| pred(c)).count())
    }

    /// argv of every exec, in order.
    pub fn execs(&self) -> Vec<Vec<String>> {
        self.with_state(|s| {
            s.calls
                .iter()
                .filter_map(|c| match c {
                    RuntimeCall::Exec { argv, .. } => Some(argv.clone()),
                    _ => None,
                })
                .collect()
        })
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.with_state(|s| s.containers.get(name).is_some_and(|c| c.running))
    }

    pub fn container_spec(&self, name: &str) -> Option<ContainerSpec> {
        self.with_state(|s| s.containers.get(name).and_then(|c| c.spec.clone()))
    }

    pub fn plugin_enabled(&self, qualified: &str) -> Option<bool> {
        self.with_state(|s| s.plugins.get(qualified).copied())
    }

    /// Record the call, apply latency, then report a scripted failure.
    async fn enter(&self, call: RuntimeCall, point: FailPoint) -> RuntimeResult<()> {
        let latency = self.with_state(|s| {
            s.calls.push(call);
            s.latency
        });
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let failing = self.with_state(|s| s.failing.contains(&point));
        if failing {
            return Err(RuntimeError::Unavailable(format!("injected {point:?} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_containers(&self) -> RuntimeResult<Vec<String>> {
        self.enter(RuntimeCall::ListContainers, FailPoint::ListContainers)
            .await?;
        Ok(self.with_state(|s| s.containers.keys().cloned().collect()))
    }

    async fn list_images(&self) -> RuntimeResult<Vec<String>> {
        self.enter(RuntimeCall::ListImages, FailPoint::ListImages).await?;
        Ok(self.with_state(|s| s.images.iter().cloned().collect()))
    }

    async fn pull_image(&self, reference: &str) -> RuntimeResult<()> {
        self.enter(RuntimeCall::Pull(reference.to_string()), FailPoint::Pull)
            .await?;
        self.with_state(|s| {
            s.images.insert(reference.to_string());
        });
        Ok(())
    }

    async fn inspect_container(&self, name: &str) -> RuntimeResult<ContainerState> {
        self.enter(RuntimeCall::Inspect(name.to_string()), FailPoint::Inspect)
            .await?;
        self.with_state(|s| match s.containers.get(name) {
            None => Err(RuntimeError::NotFound(name.to_string())),
            Some(c) if c.corrupt => Err(RuntimeError::Unavailable(format!(
                "state of {name} is unreadable"
            ))),
            Some(c) => Ok(ContainerState {
                id: ContainerId::new(c.id.clone()),
                running: c.running,
            }),
        })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<ContainerId> {
        self.enter(RuntimeCall::Create(spec.name.clone()), FailPoint::Create)
            .await?;
        self.with_state(|s| {
            if s.containers.contains_key(&spec.name) {
                return Err(RuntimeError::Rejected(format!(
                    "name {} is already in use",
                    spec.name
                )));
            }
            let id = Self::allocate_id(s);
            s.containers.insert(
                spec.name.clone(),
                MockContainer {
                    id: id.clone(),
                    running: false,
                    corrupt: false,
                    spec: Some(spec.clone()),
                },
            );
            Ok(ContainerId::new(id))
        })
    }

    async fn start_container(&self, name: &str) -> RuntimeResult<()> {
        self.enter(RuntimeCall::Start(name.to_string()), FailPoint::Start)
            .await?;
        self.with_state(|s| match s.containers.get_mut(name) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(name.to_string())),
        })
    }

    async fn delete_container(&self, name: &str) -> RuntimeResult<()> {
        self.enter(RuntimeCall::Delete(name.to_string()), FailPoint::Delete)
            .await?;
        self.with_state(|s| match s.containers.remove(name) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NotFound(name.to_string())),
        })
    }

    async fn exec_detached(
        &self,
        container: &ContainerId,
        argv: &[String],
    ) -> RuntimeResult<ExecHandle> {
        self.enter(
            RuntimeCall::Exec {
                container: container.to_string(),
                argv: argv.to_vec(),
            },
            FailPoint::Exec,
        )
        .await?;
        self.with_state(|s| {
            if let Some(budget) = s.exec_budget.as_mut() {
                if *budget == 0 {
                    return Err(RuntimeError::Rejected("exec refused".into()));
                }
                *budget -= 1;
            }
            let running = s
                .containers
                .values()
                .any(|c| c.id == container.as_str() && c.running);
            if !running {
                return Err(RuntimeError::Rejected(format!(
                    "container {container} is not running"
                )));
            }
            s.next_id += 1;
            Ok(ExecHandle(format!("exec-{:04}", s.next_id)))
        })
    }

    async fn list_plugins(&self) -> RuntimeResult<Vec<String>> {
        self.enter(RuntimeCall::ListPlugins, FailPoint::ListPlugins)
            .await?;
        Ok(self.with_state(|s| s.plugins.keys().cloned().collect()))
    }

    async fn install_plugin(&self, opts: &PluginInstall) -> RuntimeResult<()> {
        self.enter(
            RuntimeCall::InstallPlugin(opts.remote.clone()),
            FailPoint::InstallPlugin,
        )
        .await?;
        self.with_state(|s| {
            s.plugins.insert(qualify(&opts.remote), !opts.disabled);
        });
        Ok(())
    }

    async fn is_plugin_enabled(&self, reference: &str) -> RuntimeResult<bool> {
        self.enter(
            RuntimeCall::PluginEnabled(reference.to_string()),
            FailPoint::PluginEnabled,
        )
        .await?;
        self.with_state(|s| {
            s.plugins
                .get(&qualify(reference))
                .copied()
                .ok_or_else(|| RuntimeError::NotFound(format!("plugin {reference}")))
        })
    }

    async fn enable_plugin(&self, reference: &str) -> RuntimeResult<()> {
        self.enter(
            RuntimeCall::EnablePlugin(reference.to_string()),
            FailPoint::EnablePlugin,
        )
        .await?;
        self.with_state(|s| match s.plugins.get_mut(&qualify(reference)) {
            Some(enabled) => {
                *enabled = true;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(format!("plugin {reference}"))),
        })
    }
}
