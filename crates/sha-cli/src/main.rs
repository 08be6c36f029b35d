mod cli;
mod commands;
mod output;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let remote = cli.remote;
    let token = cli.token;

    match cli.command {
        Command::Bootstrap { config, ephemeral, bind, port } => {
            commands::bootstrap(config, ephemeral, bind, port).await
        }
        Command::Recover { config, threshold_minutes } => {
            let code = commands::recover(config, threshold_minutes).await?;
            std::process::exit(code);
        }
        Command::Replicate { vm_context_id, source_vm, hub_vm_id, disks, incremental, owner } => {
            commands::replicate(vm_context_id, source_vm, hub_vm_id, disks, incremental, owner, remote, token).await
        }
        Command::Backup(cmd) => commands::backup(cmd, remote, token).await,
        Command::Failover(cmd) => commands::failover(cmd, remote, token).await,
        Command::Job { job_id, progress } => commands::job(job_id, progress, remote, token).await,
        Command::VmContexts { vm_context_id, limit } => {
            commands::vm_contexts(vm_context_id, limit, remote, token).await
        }
        Command::Status => commands::status(remote, token).await,
        Command::Admin(cmd) => commands::admin(cmd, remote, token).await,
    }
}
