use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mvirt_ctr::Config;
use mvirt_ctr::daemon::Daemon;
use mvirt_ctr::forkstart::ForkStart;

#[derive(Parser)]
#[command(name = "mvirt-ctr")]
#[command(about = "mvirt container daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon
    Daemon(DaemonArgs),

    /// Start one container from a prepared runtime config
    Forkstart {
        /// Container name
        name: String,

        /// Runtime state directory
        runtime_root: PathBuf,

        /// Path to config.json inside the bundle
        config_path: PathBuf,

        /// Directory the runtime config is moved to on success
        #[arg(long, default_value = "/var/lib/mvirt/ctr/logs")]
        log_dir: PathBuf,

        /// OCI runtime binary
        #[arg(long, default_value = "/usr/bin/youki")]
        runtime: PathBuf,
    },
}

#[derive(Args)]
struct DaemonArgs {
    /// Data directory for the database, bundles and snapshots
    #[arg(short, long, default_value = "/var/lib/mvirt/ctr")]
    data_dir: PathBuf,

    /// OCI runtime binary
    #[arg(long, default_value = "/usr/bin/youki")]
    runtime: PathBuf,

    /// Runtime state directory (runtime default if unset)
    #[arg(long)]
    runtime_root: Option<PathBuf>,

    /// Channel listen address (host:port or unix:/path)
    #[arg(short, long, default_value = "[::1]:50060")]
    listen: String,

    /// Project to operate on
    #[arg(long, default_value = "default")]
    project: String,

    /// Seconds to wait for session channels to connect
    #[arg(long, default_value_t = 30)]
    connect_timeout: u64,

    /// Seconds to wait for graceful instance shutdown
    #[arg(long, default_value_t = 30)]
    shutdown_timeout: u64,

    /// Maximum instances shut down concurrently
    #[arg(long, default_value_t = 16)]
    shutdown_parallelism: usize,

    /// Maximum pre-dump rounds during live migration
    #[arg(long, default_value_t = 10)]
    predump_max_rounds: u32,

    /// Pre-dump size in bytes considered converged
    #[arg(long, default_value_t = 1024 * 1024)]
    predump_threshold: u64,
}

impl From<DaemonArgs> for Config {
    fn from(args: DaemonArgs) -> Self {
        Config {
            data_dir: args.data_dir,
            runtime_path: args.runtime,
            runtime_root: args.runtime_root,
            listen: args.listen,
            project: args.project,
            connect_timeout: Duration::from_secs(args.connect_timeout),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            shutdown_parallelism: args.shutdown_parallelism,
            predump_max_rounds: args.predump_max_rounds,
            predump_threshold: args.predump_threshold,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mvirt_ctr=info".parse()?))
        .init();

    match Cli::parse().command {
        Command::Daemon(args) => {
            let daemon = Daemon::open(args.into())
                .await
                .context("failed to initialize daemon")?;
            daemon.run().await?;
        }
        Command::Forkstart {
            name,
            runtime_root,
            config_path,
            log_dir,
            runtime,
        } => {
            ForkStart {
                name: name.clone(),
                runtime_path: runtime,
                runtime_root,
                config_path,
                log_dir,
            }
            .run()
            .await
            .with_context(|| format!("failed to start container {name}"))?;
        }
    }

    Ok(())
}
