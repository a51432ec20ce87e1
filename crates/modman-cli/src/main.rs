//! Modman - cluster bundle lifecycle manager
//!
//! Usage:
//!   modman node run                       # Serve this node's operation queue
//!   modman node scan                      # Show the local bundle inventory
//!   modman install demo-1.0.jar -n n1,n2  # Queue an install on two nodes
//!   modman state demo-1.0                 # Per-node state of a bundle

mod output;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use modman_core::config::NodeConfig;
use modman_core::context::NodeContext;
use modman_core::coordinator::UploadedContent;
use modman_core::model::OperationAction;

#[derive(Parser)]
#[command(name = "modman")]
#[command(about = "Cluster bundle lifecycle manager", long_about = None)]
struct Cli {
    /// Config file (defaults to <config dir>/modman/modman.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the node id from the config file
    #[arg(long, global = true)]
    node: Option<String>,

    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run or inspect this node
    Node(NodeArgs),

    /// Upload a bundle archive and install it on the target nodes
    Install {
        /// Bundle archive to upload
        file: PathBuf,
        #[command(flatten)]
        targets: Targets,
    },

    /// Uninstall a bundle from the target nodes
    #[command(alias = "rm")]
    Uninstall {
        /// Bundle key (`symbolicName-version`)
        bundle: String,
        #[command(flatten)]
        targets: Targets,
    },

    /// Start a bundle on the target nodes
    Start {
        bundle: String,
        #[command(flatten)]
        targets: Targets,
    },

    /// Stop a bundle on the target nodes
    Stop {
        bundle: String,
        #[command(flatten)]
        targets: Targets,
    },

    /// Show committed bundle state per node
    State {
        /// Only this bundle
        bundle: Option<String>,
        /// Nodes to read (default: every registered node)
        #[arg(short = 'n', long = "nodes", value_delimiter = ',')]
        nodes: Vec<String>,
    },

    /// List the operation records of a node
    Ops {
        /// Node to list (default: this node)
        target: Option<String>,
    },

    /// Delete finished operation records of this node
    Compact {
        /// Keep records that finished within this many hours
        #[arg(long, default_value_t = 168)]
        older_than_hours: i64,
    },
}

#[derive(Args)]
struct NodeArgs {
    #[command(subcommand)]
    command: NodeCommand,
}

#[derive(Subcommand)]
enum NodeCommand {
    /// Join the cluster and process operations until interrupted
    Run {
        /// Process the current queue once and exit
        #[arg(long)]
        once: bool,
    },

    /// Scan the local runtime for managed bundles
    Scan {
        /// Also write the result back to the shared store
        #[arg(long)]
        reconcile: bool,
    },

    /// List every package loaded in the local runtime
    Packages,
}

#[derive(Args)]
struct Targets {
    /// Target node ids, comma separated
    #[arg(short = 'n', long = "nodes", value_delimiter = ',', required = true)]
    nodes: Vec<String>,
}

#[derive(Clone, Copy, ValueEnum, Default)]
pub(crate) enum OutputFormat {
    /// Human-readable table
    #[default]
    Table,
    /// Machine-readable JSON
    Json,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "modman=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let context = open_context(cli.config.as_deref(), cli.node.as_deref())?;
    run_cli(cli.command, &context, cli.format)
}

fn open_context(config: Option<&std::path::Path>, node: Option<&str>) -> Result<NodeContext> {
    let path = match config {
        Some(path) => path.to_path_buf(),
        None => NodeConfig::default_path()?,
    };
    let mut config = NodeConfig::load(&path)?;
    if let Some(node) = node {
        config.node_id = node.to_string();
    }
    NodeContext::open(config)
}

fn run_cli(command: Commands, context: &NodeContext, format: OutputFormat) -> Result<()> {
    match command {
        Commands::Node(args) => match args.command {
            NodeCommand::Run { once } => run_node(context, once, format),
            NodeCommand::Scan { reconcile } => run_scan(context, reconcile, format),
            NodeCommand::Packages => {
                let packages = modman_core::runtime::summarize(context.runtime().as_ref())?;
                output::print_packages(&packages, format)
            }
        },
        Commands::Install { file, targets } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let filename = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let result = context
                .coordinator()
                .install(&UploadedContent::new(filename, bytes), &targets.nodes)?;
            output::print_operation_result(&result, format)
        }
        Commands::Uninstall { bundle, targets } => {
            submit(context, OperationAction::Uninstall, &bundle, &targets, format)
        }
        Commands::Start { bundle, targets } => {
            submit(context, OperationAction::Start, &bundle, &targets, format)
        }
        Commands::Stop { bundle, targets } => {
            submit(context, OperationAction::Stop, &bundle, &targets, format)
        }
        Commands::State { bundle, nodes } => {
            let coordinator = context.coordinator();
            let report = match bundle {
                Some(bundle) => coordinator.get_state(&bundle, &nodes)?,
                None => coordinator.get_states(&nodes)?,
            };
            output::print_state_report(&report, format)
        }
        Commands::Ops { target } => {
            let node = target.as_deref().unwrap_or(context.node_id());
            let operations = context.coordinator().operations(node)?;
            output::print_operations(node, &operations, format)
        }
        Commands::Compact { older_than_hours } => {
            let removed = context
                .processor()
                .compact(chrono_hours(older_than_hours))?;
            output::print_compacted(context.node_id(), removed, format)
        }
    }
}

fn submit(
    context: &NodeContext,
    action: OperationAction,
    bundle: &str,
    targets: &Targets,
    format: OutputFormat,
) -> Result<()> {
    let coordinator = context.coordinator();
    let result = match action {
        OperationAction::Uninstall => coordinator.uninstall(bundle, &targets.nodes)?,
        OperationAction::Start => coordinator.start(bundle, &targets.nodes)?,
        OperationAction::Stop => coordinator.stop(bundle, &targets.nodes)?,
        OperationAction::Install => anyhow::bail!("install takes a file, not a bundle key"),
    };
    output::print_operation_result(&result, format)
}

fn run_node(context: &NodeContext, once: bool, format: OutputFormat) -> Result<()> {
    context.coordinator().register_node(context.node_id())?;

    if once {
        let summary = context.processor().process()?;
        return output::print_process_summary(context.node_id(), &summary, format);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(async {
        let handle = context.listener().spawn()?;
        info!(node = %context.node_id(), "Node running, press Ctrl-C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        info!("Shutting down");
        handle.shutdown().await
    })
}

fn run_scan(context: &NodeContext, reconcile: bool, format: OutputFormat) -> Result<()> {
    if reconcile {
        let report = context.reconciler().reconcile()?;
        return output::print_reconcile_report(&report, format);
    }
    let report = context.reconciler().scan()?;
    output::print_scan_report(&report, format)
}

fn chrono_hours(hours: i64) -> chrono::Duration {
    chrono::Duration::hours(hours.max(0))
}
