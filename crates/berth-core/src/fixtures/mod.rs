//! Test doubles and builders for the provisioning engine.
//!
//! Enable with the `test-fixtures` feature. Everything here is in-memory and
//! scriptable: calls are recorded and individual operations can be told to
//! fail, so tests can assert what was (and was not) written after a failure.

mod runtime;

pub use runtime::{FailPoint, MockRuntime, RuntimeCall};

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::BerthConfig;
use crate::directory::{DirectoryResult, MemDirectory, ServiceDirectory};
use crate::error::{DirectoryError, StoreError};
use crate::instance::{
    Instance, InstanceFilter, InstancePatch, Kind, Payload, RecordId, StoredInstance,
};
use crate::pipeline::Pipeline;
use crate::reconciler::StateReconciler;
use crate::request::{
    AppContext, DatabaseRequest, NodeApp, ProvisionRequest, PythonApp, PythonVersion, StaticApp,
    StorageRequest,
};
use crate::store::{MetadataStore, StoreResult};

/// Image every application kind resolves to under [`test_config`].
pub const TEST_IMAGE: &str = "img:v1";

/// Address the [`TestNode`] starts on.
pub const TEST_HOST: &str = "10.0.0.5";

/// Config with short deadlines and every image pointing at [`TEST_IMAGE`].
pub fn test_config() -> BerthConfig {
    let mut config = BerthConfig::default();
    config.images.python2 = TEST_IMAGE.into();
    config.images.python3 = TEST_IMAGE.into();
    config.images.node = TEST_IMAGE.into();
    config.images.static_site = TEST_IMAGE.into();
    config.deadlines.runtime_secs = 5;
    config.deadlines.pull_secs = 5;
    config
}

pub fn python_request(name: &str) -> ProvisionRequest {
    ProvisionRequest::Python(PythonApp {
        name: name.into(),
        url: format!("https://git.example.com/{name}.git"),
        context: AppContext {
            index: "main.py".into(),
            port: 8000,
            args: vec![],
        },
        python_version: PythonVersion::Three,
        requirements: Some("requirements.txt".into()),
        django: false,
        env: BTreeMap::new(),
    })
}

pub fn node_request(name: &str) -> ProvisionRequest {
    ProvisionRequest::Node(NodeApp {
        name: name.into(),
        url: format!("https://git.example.com/{name}.git"),
        context: AppContext {
            index: "server.js".into(),
            port: 3000,
            args: vec![],
        },
        build_args: vec![],
        env: BTreeMap::new(),
    })
}

pub fn static_request(name: &str) -> ProvisionRequest {
    ProvisionRequest::Static(StaticApp {
        name: name.into(),
        url: format!("https://git.example.com/{name}.git"),
        port: 8080,
        env: BTreeMap::new(),
    })
}

pub fn mysql_request(name: &str) -> ProvisionRequest {
    ProvisionRequest::Mysql(DatabaseRequest {
        name: name.into(),
        port: None,
        env: BTreeMap::new(),
    })
}

pub fn storage_request(name: &str) -> ProvisionRequest {
    ProvisionRequest::Lizardfs(StorageRequest {
        name: name.into(),
        port: None,
        volume: None,
    })
}

pub fn sample_instance(name: &str, kind: Kind, host: &str) -> Instance {
    Instance {
        name: name.into(),
        class: kind.class(),
        kind,
        container_id: format!("c-{name}"),
        host_address: host.into(),
        port: 8000,
        created_at: 0,
        payload: Payload::App {
            source_url: format!("https://git.example.com/{name}.git"),
            env: BTreeMap::new(),
            build_args: vec![],
        },
    }
}

/// Metadata store operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Find,
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Default)]
struct StoreState {
    records: BTreeMap<u64, Instance>,
    next_id: u64,
    failing: HashSet<StoreOp>,
    inserts: usize,
    updates: usize,
}

/// In-memory metadata store.
#[derive(Debug, Default)]
pub struct MemMetadataStore {
    state: Mutex<StoreState>,
}

impl MemMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, op: StoreOp) {
        self.state.lock().unwrap().failing.insert(op);
    }

    pub fn heal(&self, op: StoreOp) {
        self.state.lock().unwrap().failing.remove(&op);
    }

    pub fn records(&self) -> Vec<StoredInstance> {
        let state = self.state.lock().unwrap();
        state
            .records
            .iter()
            .map(|(id, instance)| StoredInstance {
                id: RecordId(*id),
                instance: instance.clone(),
            })
            .collect()
    }

    pub fn insert_calls(&self) -> usize {
        self.state.lock().unwrap().inserts
    }

    pub fn update_calls(&self) -> usize {
        self.state.lock().unwrap().updates
    }

    fn check(state: &StoreState, op: StoreOp) -> StoreResult<()> {
        if state.failing.contains(&op) {
            return Err(StoreError::Backend(format!("injected {op:?} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for MemMetadataStore {
    async fn find(&self, filter: &InstanceFilter) -> StoreResult<Vec<StoredInstance>> {
        let state = self.state.lock().unwrap();
        Self::check(&state, StoreOp::Find)?;
        Ok(state
            .records
            .iter()
            .filter(|(_, instance)| filter.matches(instance))
            .map(|(id, instance)| StoredInstance {
                id: RecordId(*id),
                instance: instance.clone(),
            })
            .collect())
    }

    async fn insert(&self, instance: &Instance) -> StoreResult<RecordId> {
        let mut state = self.state.lock().unwrap();
        state.inserts += 1;
        Self::check(&state, StoreOp::Insert)?;
        state.next_id += 1;
        let id = state.next_id;
        state.records.insert(id, instance.clone());
        Ok(RecordId(id))
    }

    async fn update_many(
        &self,
        filter: &InstanceFilter,
        patch: &InstancePatch,
    ) -> StoreResult<u64> {
        let mut state = self.state.lock().unwrap();
        state.updates += 1;
        Self::check(&state, StoreOp::Update)?;
        let mut count = 0;
        for instance in state.records.values_mut() {
            if filter.matches(instance) {
                patch.apply(instance);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete_many(&self, filter: &InstanceFilter) -> StoreResult<u64> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, StoreOp::Delete)?;
        let before = state.records.len();
        state.records.retain(|_, instance| !filter.matches(instance));
        Ok((before - state.records.len()) as u64)
    }
}

/// [`MemDirectory`] with an off switch and a register counter.
#[derive(Debug, Default)]
pub struct FlakyDirectory {
    inner: MemDirectory,
    failing: Mutex<bool>,
    registrations: Mutex<Vec<(Kind, String)>>,
}

impl FlakyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn registrations(&self) -> Vec<(Kind, String)> {
        self.registrations.lock().unwrap().clone()
    }

    fn check(&self) -> DirectoryResult<()> {
        if *self.failing.lock().unwrap() {
            return Err(DirectoryError::Backend("directory unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceDirectory for FlakyDirectory {
    async fn register(&self, service: Kind, address: &str) -> DirectoryResult<()> {
        self.check()?;
        self.registrations
            .lock()
            .unwrap()
            .push((service, address.to_string()));
        self.inner.register(service, address).await
    }

    async fn increment_load(&self, service: Kind, address: &str) -> DirectoryResult<u64> {
        self.check()?;
        self.inner.increment_load(service, address).await
    }

    async fn decrement_load(&self, service: Kind, address: &str) -> DirectoryResult<u64> {
        self.check()?;
        self.inner.decrement_load(service, address).await
    }

    async fn least_loaded(&self, service: Kind) -> DirectoryResult<Option<String>> {
        self.check()?;
        self.inner.least_loaded(service).await
    }

    async fn entries(&self, service: Kind) -> DirectoryResult<Vec<(String, u64)>> {
        self.check()?;
        self.inner.entries(service).await
    }

    async fn relocate(&self, service: Kind, from: &str, to: &str) -> DirectoryResult<bool> {
        self.check()?;
        self.inner.relocate(service, from, to).await
    }
}

/// A pipeline and reconciler wired to in-memory collaborators.
pub struct TestNode {
    pub runtime: Arc<MockRuntime>,
    pub store: Arc<MemMetadataStore>,
    pub directory: Arc<FlakyDirectory>,
    pub reconciler: StateReconciler,
    pub pipeline: Pipeline,
}

impl TestNode {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: BerthConfig) -> Self {
        let runtime = Arc::new(MockRuntime::new());
        let store = Arc::new(MemMetadataStore::new());
        let directory = Arc::new(FlakyDirectory::new());
        let reconciler = StateReconciler::new(store.clone(), TEST_HOST);
        let pipeline = Pipeline::new(
            runtime.clone(),
            store.clone(),
            directory.clone(),
            reconciler.address(),
            Arc::new(config),
        );
        Self {
            runtime,
            store,
            directory,
            reconciler,
            pipeline,
        }
    }
}

impl Default for TestNode {
    fn default() -> Self {
        Self::new()
    }
}
