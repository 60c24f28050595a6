//! `berthd provision`: run one request through the pipeline.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use berth_core::ProvisionRequest;
use clap::Args;
use serde_json::json;
use tracing::error;

use crate::node::Node;
use crate::opts::NodeOpts;
use crate::output::print_json;

#[derive(Args, Debug)]
pub struct ProvisionArgs {
    /// JSON request file; reads stdin when omitted
    #[arg(long, short = 'f')]
    pub file: Option<PathBuf>,
}

pub async fn cmd_provision(opts: &NodeOpts, args: &ProvisionArgs) -> Result<()> {
    let body = read_request(args)?;
    // Reject malformed requests before touching docker or the database.
    let request = ProvisionRequest::from_json(&body)?;

    let node = Node::start(opts).await?;
    let handle = match node.pipeline.provision(request).await {
        Ok(handle) => handle,
        Err(err) => {
            if err.leaves_inconsistency() {
                error!(
                    class = %err.class(),
                    step = %err.step(),
                    "instance is running but not fully recorded; retry the request to repair it"
                );
            }
            return Err(err).context("provision failed");
        }
    };

    print_json(
        opts,
        &json!({
            "id": handle.id,
            "name": handle.name,
            "kind": handle.kind,
            "container_id": handle.container_id.as_str(),
            "address": handle.address,
            "action": handle.action.as_str(),
        }),
    )
}

fn read_request(args: &ProvisionArgs) -> Result<String> {
    match &args.file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("read request {}", path.display())),
        None => {
            let mut body = String::new();
            std::io::stdin()
                .read_to_string(&mut body)
                .context("read request from stdin")?;
            Ok(body)
        }
    }
}
