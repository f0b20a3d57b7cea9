//! vircpt - main entry point
//!
//! Create, list, show, delete and export libvirt checkpoints.

use anyhow::{bail, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use vircpt::checkpoint::{self, DeleteOutcome};
use vircpt::disk::{self, DiskFilter};
use vircpt::export::Transport;
use vircpt::hypervisor::{Hypervisor, HypervisorError, VirshHypervisor};
use vircpt::session::{self, ExportOptions};
use vircpt::{utils, Config, VircptError};

#[derive(Parser, Debug)]
#[command(author, version, about = "Libvirt checkpoint swiss army knife", long_about = None)]
struct Args {
    /// Libvirt connection URI (overrides config)
    #[arg(short = 'U', long)]
    uri: Option<String>,

    /// Domain to operate on
    #[arg(short, long)]
    domain: String,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug output
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug)]
struct DiskArgs {
    /// Comma separated list of disks to exclude
    #[arg(short = 'x', long)]
    exclude: Option<String>,

    /// Only operate on this disk
    #[arg(short, long)]
    include: Option<String>,

    /// Include raw disks, block devices and LUNs (crash consistent only)
    #[arg(long)]
    raw: bool,
}

impl DiskArgs {
    fn filter(&self) -> DiskFilter {
        DiskFilter::new(self.exclude.as_deref(), self.include.clone(), self.raw)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a checkpoint
    Create {
        /// Checkpoint name
        #[arg(short, long)]
        name: String,

        #[command(flatten)]
        disks: DiskArgs,
    },

    /// Delete one or all checkpoints
    Delete {
        /// Checkpoint name
        #[arg(short, long, required_unless_present = "all")]
        name: Option<String>,

        /// Delete every checkpoint of the domain
        #[arg(long, conflicts_with = "name")]
        all: bool,
    },

    /// List checkpoints
    List {
        /// Print checkpoint details as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a checkpoint's description
    Show {
        /// Checkpoint name
        #[arg(short, long)]
        name: String,
    },

    /// Export checkpoint data via NBD
    Export {
        /// Checkpoint name
        #[arg(short, long)]
        name: String,

        /// Create the checkpoint if it does not exist yet
        #[arg(long)]
        create: bool,

        /// Freeze guest filesystems while the export starts
        #[arg(long)]
        freeze: bool,

        /// Directory for scratch files (overrides config)
        #[arg(short, long)]
        scratch_dir: Option<PathBuf>,

        /// NBD socket for local exports (overrides config)
        #[arg(long)]
        socket: Option<PathBuf>,

        /// NBD port for remote exports (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable TLS for remote exports
        #[arg(long)]
        tls: bool,

        #[command(flatten)]
        disks: DiskArgs,
    },

    /// Stop a running export
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };
    if let Some(uri) = &args.uri {
        config.connection.uri = uri.clone();
    }

    // Initialize logging
    let log_level = if args.verbose {
        "debug"
    } else {
        args.log_level.as_deref().unwrap_or(&config.log.level)
    };
    utils::logger::init(log_level)?;

    tracing::info!(
        "Version: {} Arguments: {}",
        env!("CARGO_PKG_VERSION"),
        std::env::args().collect::<Vec<_>>().join(" ")
    );

    let hv = VirshHypervisor::connect(&config.connection.uri, &config.connection.virsh)
        .await
        .map_err(VircptError::from)?;
    let domain = hv.lookup_domain(&args.domain).await.map_err(|e| match e {
        HypervisorError::NotFound(_) => VircptError::DomainNotFound(args.domain.clone()),
        other => other.into(),
    })?;

    match args.command {
        Command::Create { name, disks } => {
            let disks = disk::domain_disks(&hv, &domain, &disks.filter()).await?;
            if disks.is_empty() {
                bail!("No disks left to create checkpoint [{}]", name);
            }
            checkpoint::create(&hv, &domain, &name, &disks).await?;
        }
        Command::Delete { name, all } => {
            if all {
                let outcomes = checkpoint::delete_all(&hv, &domain).await?;
                let failed = outcomes.iter().filter(|(_, o)| !o.is_success()).count();
                for (name, outcome) in &outcomes {
                    tracing::info!("Checkpoint [{}]: {:?}", name, outcome);
                }
                if failed > 0 {
                    bail!("{} of {} checkpoints could not be removed", failed, outcomes.len());
                }
            } else if let Some(name) = name {
                match checkpoint::delete(&hv, &domain, &name).await {
                    DeleteOutcome::Removed => tracing::info!("Removed checkpoint [{}]", name),
                    DeleteOutcome::AlreadyGone => tracing::warn!("Checkpoint [{}] does not exist", name),
                    DeleteOutcome::Failed(e) => bail!("Failed to remove checkpoint [{}]: {}", name, e),
                }
            }
        }
        Command::List { json } => {
            if json {
                let checkpoints = checkpoint::list_details(&hv, &domain).await?;
                println!("{}", serde_json::to_string_pretty(&checkpoints)?);
            } else {
                for name in checkpoint::list(&hv, &domain).await? {
                    println!(" + {}", name);
                }
            }
        }
        Command::Show { name } => {
            print!("{}", checkpoint::describe(&hv, &domain, &name).await?);
        }
        Command::Export {
            name,
            create,
            freeze,
            scratch_dir,
            socket,
            port,
            tls,
            disks,
        } => {
            let mut export = config.export.clone();
            if let Some(dir) = scratch_dir {
                export.scratch_dir = dir;
            }
            if let Some(socket) = socket {
                export.socket = socket;
            }
            if let Some(port) = port {
                export.port = port;
            }
            export.tls |= tls;

            let options = ExportOptions {
                name,
                create,
                freeze,
                filter: disks.filter(),
                export,
            };
            let session = session::export_checkpoint(&hv, &domain, &options).await?;

            match &session.request().transport {
                Transport::Unix { socket } => {
                    println!("Export started, NBD socket: {}", socket.display())
                }
                Transport::Tcp { name, port, tls } => {
                    println!("Export started, NBD server: {}:{} (tls: {})", name, port, tls)
                }
            }
            for disk in &session.request().disks {
                println!(" + {} (scratch: {})", disk.target, disk.scratch.display());
            }
            if session.thaw_failed() {
                tracing::error!(
                    "Filesystems of domain [{}] are still frozen, thaw them manually",
                    domain
                );
            }
        }
        Command::Stop => {
            session::abort_export(&hv, &domain).await?;
        }
    }

    Ok(())
}
