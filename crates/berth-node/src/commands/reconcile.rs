//! `berthd reconcile`: one-shot host address move.

use std::sync::Arc;

use anyhow::{Context, Result};
use berth_core::directory::move_entries;
use berth_core::{InstanceFilter, MetadataStore, ReconcileOutcome, StateReconciler};
use clap::Args;
use serde_json::json;

use crate::node::{self, open_store};
use crate::opts::NodeOpts;
use crate::output::print_json;

#[derive(Args, Debug)]
pub struct ReconcileArgs {
    /// Address the records currently carry
    #[arg(long)]
    pub from: String,

    /// New address; defaults to the pinned or detected host address
    #[arg(long)]
    pub to: Option<String>,
}

pub async fn cmd_reconcile(opts: &NodeOpts, args: &ReconcileArgs) -> Result<()> {
    let store = open_store(opts)?;
    let to = match &args.to {
        Some(to) => to.clone(),
        None => node::host_address(opts).await?,
    };

    let reconciler = StateReconciler::new(Arc::new(store.clone()), args.from.clone());
    let outcome = reconciler
        .reconcile(&to)
        .await
        .with_context(|| format!("move records from {} to {to}", args.from))?;

    let value = match outcome {
        ReconcileOutcome::Unchanged => json!({ "changed": false, "address": to, "records": 0 }),
        ReconcileOutcome::Repointed { from, to, records } => {
            let moved_records = store
                .find(&InstanceFilter::on_host(to.clone()))
                .await
                .context("read repointed instances")?;
            let moved = move_entries(&store.directory(), &moved_records, &from).await;
            json!({
                "changed": true,
                "from": from,
                "address": to,
                "records": records,
                "directory_entries": moved,
            })
        }
    };
    print_json(opts, &value)
}
