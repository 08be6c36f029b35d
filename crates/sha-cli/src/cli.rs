use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "shactl",
    about = "Operator CLI for the migration & backup control plane",
    version
)]
pub struct Cli {
    /// Base URL of a running SHA server. Not used by `bootstrap` or `recover`.
    #[arg(long, env = "SHA_URL", global = true)]
    pub remote: Option<String>,

    /// Bearer token for the Control API. Falls back to ~/.sha/token.
    #[arg(long, env = "SHA_TOKEN", global = true)]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start a SHA server in-process against the configured store.
    Bootstrap {
        /// Path to the TOML config file (defaults to /etc/sha/config.toml or $SHA_CONFIG).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Use an in-memory store regardless of the config's store location.
        #[arg(long)]
        ephemeral: bool,

        #[arg(long, default_value = "0.0.0.0")]
        bind: String,

        #[arg(long, default_value_t = 8080)]
        port: u16,
    },

    /// Run the orphan-job recovery pass directly against the store, without a running server.
    Recover {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Minutes a running job/step may go untouched before it's considered orphaned.
        #[arg(long)]
        threshold_minutes: Option<i64>,
    },

    /// Start a disk replication job.
    Replicate {
        vm_context_id: String,
        source_vm: String,
        hub_vm_id: String,
        /// disk_id:size_bytes:offering_id:zone_id[:previous_change_id]
        #[arg(long = "disk", required = true)]
        disks: Vec<String>,
        #[arg(long)]
        incremental: bool,
        #[arg(long)]
        owner: Option<String>,
    },

    /// Start, restore, or mount a backup.
    #[command(subcommand)]
    Backup(BackupCommand),

    /// Run or roll back a failover.
    #[command(subcommand)]
    Failover(FailoverCommand),

    /// Inspect a job.
    Job {
        job_id: String,
        /// Show aggregated progress instead of the job summary.
        #[arg(long)]
        progress: bool,
    },

    /// List VM contexts, or the recent jobs for one.
    VmContexts {
        /// Show recent jobs for this VM context instead of listing all contexts.
        vm_context_id: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Print an aggregate health/activity summary.
    Status,

    /// Enrollment administration.
    #[command(subcommand)]
    Admin(AdminCommand),
}

#[derive(Debug, Subcommand)]
pub enum BackupCommand {
    /// Start a backup job.
    Start {
        vm_context_id: String,
        source_vm: String,
        hub_vm_id: String,
        /// disk_id:size_bytes:offering_id:zone_id
        #[arg(long = "disk", required = true)]
        disks: Vec<String>,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Restore backed-up volumes onto a production VM (no expiry).
    Restore {
        vm_context_id: String,
        restore_vm_id: String,
        #[arg(long = "volume", required = true)]
        volume_ids: Vec<String>,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Mount backed-up volumes for inspection, with an expiry.
    Mount {
        vm_context_id: String,
        restore_vm_id: String,
        #[arg(long = "volume", required = true)]
        volume_ids: Vec<String>,
        #[arg(long)]
        ttl_seconds: i64,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Cancel a mount (or restore) job, releasing the mounted volumes.
    Unmount {
        /// The job id returned by `backup mount` or `backup restore`.
        job_id: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum FailoverCommand {
    Start {
        context_id: String,
        hub_vm_id: String,
        target_vm_id: String,
        #[arg(long, value_enum)]
        kind: FailoverKindArg,
        #[arg(long = "volume", required = true)]
        volume_ids: Vec<String>,
        #[arg(long)]
        source_vm_path: Option<String>,
        #[arg(long)]
        power_off_source: bool,
        #[arg(long)]
        owner: Option<String>,
    },
    Rollback {
        context_id: String,
        hub_vm_id: String,
        cutover_vm_id: String,
        #[arg(long, value_enum)]
        kind: FailoverKindArg,
        #[arg(long = "volume", required = true)]
        volume_ids: Vec<String>,
        #[arg(long)]
        source_vm_path: Option<String>,
        #[arg(long)]
        power_on_source: bool,
        #[arg(long)]
        owner: Option<String>,
    },
}

#[derive(Debug, Clone, clap::ValueEnum)]
pub enum FailoverKindArg {
    Test,
    Live,
}

#[derive(Debug, Subcommand)]
pub enum AdminCommand {
    /// Generate a pairing code an SNA can use to enroll.
    PairingCode {
        #[arg(long, default_value_t = 600)]
        valid_for_seconds: i64,
    },
    Approve { enrollment_id: String, approver: String },
    Reject { enrollment_id: String, approver: String, reason: String },
    Revoke { enrollment_id: String, revoked_by: String },
}
