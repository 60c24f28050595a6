mod address;
mod commands;
mod logging;
mod node;
mod opts;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::directory::DirectoryArgs;
use commands::instances::InstancesArgs;
use commands::provision::ProvisionArgs;
use commands::reconcile::ReconcileArgs;
use opts::NodeOpts;

#[derive(Parser, Debug)]
#[command(name = "berthd", version, about = "Per-host berth provisioning daemon")]
struct Cli {
    #[command(flatten)]
    opts: NodeOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Prepare the host, republish its instances and keep the host address current
    Serve,

    /// Provision one instance from a JSON request
    Provision(ProvisionArgs),

    /// Move records from one host address to another
    Reconcile(ReconcileArgs),

    /// List recorded instances
    Instances(InstancesArgs),

    /// List routing entries and their loads
    Directory(DirectoryArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init();
    let opts = &cli.opts;

    match cli.command {
        Command::Serve => commands::serve::cmd_serve(opts).await,
        Command::Provision(args) => commands::provision::cmd_provision(opts, &args).await,
        Command::Reconcile(args) => commands::reconcile::cmd_reconcile(opts, &args).await,
        Command::Instances(args) => commands::instances::cmd_instances(opts, &args).await,
        Command::Directory(args) => commands::directory::cmd_directory(opts, &args).await,
    }
}
