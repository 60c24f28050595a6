//! `berthd serve`: prepare the host, then keep its recorded address current.

use anyhow::{Context, Result};
use berth_core::ReconcileOutcome;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::node::{self, Node};
use crate::opts::NodeOpts;

pub async fn cmd_serve(opts: &NodeOpts) -> Result<()> {
    let node = Node::start(opts).await?;

    let report = node.pipeline.prepare_host().await;
    for (image, status) in &report.images {
        match status {
            Ok(status) => info!(image = %image, ?status, "image ready"),
            Err(err) => warn!(image = %image, error = %err, "image not available"),
        }
    }
    if let Ok(plugin) = &report.plugin {
        info!(installed = plugin.installed, enabled = plugin.enabled, "volume plugin ready");
    }

    if let Err(err) = node.pipeline.republish().await {
        warn!(error = %err, "could not read instances to republish");
    }

    let mut ticker = tokio::time::interval(opts.check_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the address was just resolved.
    ticker.tick().await;

    let shutdown = shutdown_signal()?;
    tokio::pin!(shutdown);
    info!(interval_secs = opts.check_interval().as_secs(), "watching host address");
    loop {
        tokio::select! {
            _ = ticker.tick() => check_address(opts, &node).await,
            stop = &mut shutdown => {
                let received = stop?;
                info!(signal = received, "shutting down");
                return Ok(());
            }
        }
    }
}

/// Installs the SIGTERM handler now; the future resolves with the name of
/// the first stop signal received.
fn shutdown_signal() -> Result<impl Future<Output = Result<&'static str>>> {
    let mut term = signal(SignalKind::terminate()).context("listen for SIGTERM")?;
    Ok(async move {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("listen for Ctrl-C")?;
                Ok("Ctrl-C")
            }
            _ = term.recv() => Ok("SIGTERM"),
        }
    })
}

async fn check_address(opts: &NodeOpts, node: &Node) {
    let observed = match node::host_address(opts).await {
        Ok(address) => address,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "host address check failed");
            return;
        }
    };
    match node.reconciler.reconcile(&observed).await {
        Ok(ReconcileOutcome::Unchanged) => {}
        Ok(ReconcileOutcome::Repointed { from, to, records }) => {
            info!(from = %from, to = %to, records, "host address change applied");
            if let Err(err) = node.pipeline.move_published(&from).await {
                warn!(error = %err, "could not move directory entries after address change");
            }
        }
        // The cached address is kept, so the next tick retries the same move.
        Err(err) => warn!(observed = %observed, error = %err, "reconcile failed"),
    }
}
