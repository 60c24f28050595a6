//! Wiring of the engine against this host's Docker daemon and database.

use std::sync::Arc;

use anyhow::{Context, Result};
use berth_core::{BerthConfig, ContainerRuntime, Pipeline, StateReconciler};
use berth_docker::DockerRuntime;
use berth_sqlite::SqliteStore;
use tracing::info;

use crate::address;
use crate::opts::NodeOpts;

pub struct Node {
    pub pipeline: Pipeline,
    pub reconciler: StateReconciler,
}

impl Node {
    pub async fn start(opts: &NodeOpts) -> Result<Self> {
        let config = opts.load_config()?;
        let store = open_store(opts)?;
        let runtime: Arc<dyn ContainerRuntime> =
            Arc::new(DockerRuntime::connect().context("connect to docker")?);
        let host = host_address(opts).await?;
        info!(host = %host, db = %opts.db.display(), "node starting");
        Ok(Self::assemble(runtime, store, config, host))
    }

    fn assemble(
        runtime: Arc<dyn ContainerRuntime>,
        store: SqliteStore,
        config: BerthConfig,
        host: String,
    ) -> Self {
        let reconciler = StateReconciler::new(Arc::new(store.clone()), host);
        let pipeline = Pipeline::new(
            runtime,
            Arc::new(store.clone()),
            Arc::new(store.directory()),
            reconciler.address(),
            Arc::new(config),
        );
        Self {
            pipeline,
            reconciler,
        }
    }
}

/// The node database; it holds both the instance records and the directory.
pub fn open_store(opts: &NodeOpts) -> Result<SqliteStore> {
    if let Some(parent) = opts.db.parent().filter(|p| !p.as_os_str().is_empty()) {
        if opts.db.as_os_str() != berth_sqlite::IN_MEMORY {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create database directory {}", parent.display()))?;
        }
    }
    SqliteStore::open(&opts.db)
        .with_context(|| format!("open metadata database {}", opts.db.display()))
}

/// The pinned address, or the detected one.
pub async fn host_address(opts: &NodeOpts) -> Result<String> {
    match &opts.host_address {
        Some(pinned) => Ok(pinned.clone()),
        None => address::detect().await.context("detect host address"),
    }
}
