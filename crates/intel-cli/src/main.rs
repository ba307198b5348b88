mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::entity::EntitySubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "intel",
    about = "Run and inspect intelligence-gathering modules for tracked entities",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .intel/)
    #[arg(long, global = true, env = "INTEL_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .intel/ with a default config and an empty database
    Init,

    /// Start the HTTP control server
    Serve {
        /// Port to listen on (default: server.port from config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// List the module catalog
    Modules,

    /// Show module statuses for an entity
    Status {
        /// Entity id
        entity_id: u64,
    },

    /// Repair modules stuck in `running` past the staleness threshold
    Repair {
        /// Entity id
        entity_id: u64,
    },

    /// Manage entity descriptors
    Entity {
        #[command(subcommand)]
        subcommand: EntitySubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Serve { port } => cmd::serve::run(&root, port),
        Commands::Modules => cmd::modules::run(&root, cli.json),
        Commands::Status { entity_id } => cmd::status::run(&root, entity_id, cli.json),
        Commands::Repair { entity_id } => cmd::repair::run(&root, entity_id, cli.json),
        Commands::Entity { subcommand } => cmd::entity::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
