//! `berthd instances`: read recorded instances straight from the database.

use anyhow::{Context, Result};
use berth_core::{InstanceFilter, Kind, MetadataStore, ServiceClass};
use clap::Args;
use serde_json::{Value, json};

use crate::node::open_store;
use crate::opts::NodeOpts;
use crate::output::print_json;

#[derive(Args, Debug)]
pub struct InstancesArgs {
    /// Only this instance name
    #[arg(long)]
    pub name: Option<String>,

    /// Only this kind (python, node, static, mysql, mongodb, lizardfs)
    #[arg(long)]
    pub kind: Option<Kind>,

    /// Only this class (application, database, storage)
    #[arg(long)]
    pub class: Option<ServiceClass>,

    /// Only instances recorded under this host address
    #[arg(long)]
    pub host: Option<String>,
}

impl InstancesArgs {
    fn filter(&self) -> InstanceFilter {
        let mut filter = match &self.name {
            Some(name) => InstanceFilter::named(name.clone()),
            None => InstanceFilter::all(),
        };
        filter.host_address = self.host.clone();
        if let Some(kind) = self.kind {
            filter = filter.with_kind(kind);
        }
        if let Some(class) = self.class {
            filter = filter.with_class(class);
        }
        filter
    }
}

pub async fn cmd_instances(opts: &NodeOpts, args: &InstancesArgs) -> Result<()> {
    let store = open_store(opts)?;
    let records = store
        .find(&args.filter())
        .await
        .context("read instances")?;
    let rows: Vec<Value> = records
        .iter()
        .map(|r| json!({ "id": r.id, "instance": r.instance }))
        .collect();
    print_json(opts, &Value::Array(rows))
}
