//! `berthd directory`: routing entries as other hosts see them.

use anyhow::{Context, Result};
use berth_core::{Kind, ServiceDirectory};
use clap::Args;
use serde_json::{Value, json};

use crate::node::open_store;
use crate::opts::NodeOpts;
use crate::output::print_json;

#[derive(Args, Debug)]
pub struct DirectoryArgs {
    /// Only this kind; every kind when omitted
    #[arg(long)]
    pub kind: Option<Kind>,
}

pub async fn cmd_directory(opts: &NodeOpts, args: &DirectoryArgs) -> Result<()> {
    let directory = open_store(opts)?.directory();
    let kinds = match args.kind {
        Some(kind) => vec![kind],
        None => Kind::ALL.to_vec(),
    };

    let mut rows = Vec::new();
    for kind in kinds {
        let entries = directory
            .entries(kind)
            .await
            .with_context(|| format!("read directory entries for {kind}"))?;
        rows.extend(
            entries
                .into_iter()
                .map(|(address, load)| json!({ "kind": kind, "address": address, "load": load })),
        );
    }
    print_json(opts, &Value::Array(rows))
}
