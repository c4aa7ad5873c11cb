mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, receipt::ReceiptSubcommand};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "enact",
    about = "Run agent workflows behind a policy gate, with signed receipts and rollback",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .enact/ or .git/)
    #[arg(long, global = true, env = "ENACT_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .enact/config.yaml and the receipt directory
    Init,

    /// Evaluate policies and run a workflow
    Run {
        /// Registered workflow name
        workflow: String,

        /// Identity of the agent or person making the request
        #[arg(long)]
        actor: String,

        /// Payload as a JSON object
        #[arg(long, conflicts_with = "payload_file")]
        payload: Option<String>,

        /// Read the payload JSON from a file
        #[arg(long)]
        payload_file: Option<PathBuf>,
    },

    /// Undo a recorded run, newest action first
    Rollback {
        run_id: Uuid,

        /// Identity requesting the rollback
        #[arg(long)]
        actor: String,
    },

    /// Inspect and verify receipts
    Receipt {
        #[command(subcommand)]
        subcommand: ReceiptSubcommand,
    },

    /// List registered workflows
    Workflows,

    /// Show or validate the project configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } | Commands::Rollback { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Run {
            workflow,
            actor,
            payload,
            payload_file,
        } => cmd::run::run(
            &root,
            &workflow,
            &actor,
            payload.as_deref(),
            payload_file.as_deref(),
            cli.json,
        ),
        Commands::Rollback { run_id, actor } => cmd::rollback::run(&root, run_id, &actor, cli.json),
        Commands::Receipt { subcommand } => cmd::receipt::run(&root, subcommand, cli.json),
        Commands::Workflows => cmd::run::list_workflows(cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
