mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    addon::AddonSubcommand, build::BuildArgs, config::ConfigArgs, deploy::DeploySubcommand,
    registry::AddArgs,
};
use std::io::IsTerminal;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "plugforge",
    about = "Build a proxy and control plane with the plugins you choose",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: nearest directory with plugforge.json)
    #[arg(long, global = true, env = "PLUGFORGE_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a plugforge project in the current directory
    Init {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Change the pinned repositories, builder images or docker user
    Configure {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Add or update a feature repository
    #[command(visible_alias = "update")]
    Add(AddArgs),

    /// Delete a feature repository and its features
    Delete {
        /// Repository URL
        #[arg(short, long)]
        repository: String,
    },

    /// Enable a feature
    Enable {
        /// Feature name
        #[arg(short, long)]
        name: String,
    },

    /// Disable a feature
    Disable {
        /// Feature name
        #[arg(short, long)]
        name: String,
    },

    /// List registered features
    List,

    /// List registered features grouped by repository
    ListRepo,

    /// Build and package components
    Build(BuildArgs),

    /// Remove generated build and deploy files
    Clean,

    /// Deploy the built images
    Deploy {
        #[command(subcommand)]
        subcommand: DeploySubcommand,
    },

    /// Manage add-ons
    Addon {
        #[command(subcommand)]
        subcommand: AddonSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Build(_) | Commands::Deploy { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init { config } => cmd::config::init(&root, config, cli.json),
        Commands::Configure { config } => cmd::config::configure(&root, config, cli.json),
        Commands::Add(args) => cmd::registry::add(&root, args, cli.json),
        Commands::Delete { repository } => cmd::registry::delete(&root, &repository, cli.json),
        Commands::Enable { name } => cmd::registry::set_enabled(&root, &name, true, cli.json),
        Commands::Disable { name } => cmd::registry::set_enabled(&root, &name, false, cli.json),
        Commands::List => cmd::registry::list(&root, cli.json),
        Commands::ListRepo => cmd::registry::list_repo(&root, cli.json),
        Commands::Build(args) => cmd::build::run(&root, args, cli.json),
        Commands::Clean => cmd::clean::run(&root, cli.json),
        Commands::Deploy { subcommand } => cmd::deploy::run(&root, subcommand, cli.json),
        Commands::Addon { subcommand } => cmd::addon::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
