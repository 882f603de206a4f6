use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::error;

mod commands;

#[derive(Parser)]
#[command(
    name = "fleetschema",
    about = "fleetschema — zero-downtime schema upgrades for a fleet sharing one database",
    version
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Default)]
pub struct GlobalArgs {
    /// Path to fleetschema.toml (default: ./fleetschema.toml if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Catalog base URI, overrides [catalog].base_uri
    #[arg(long, global = true)]
    pub server: Option<String>,

    /// Database connection string, overrides [database].url
    #[arg(long, global = true)]
    pub connection_string: Option<String>,

    /// Database name, overrides [database].name
    #[arg(long, global = true)]
    pub database: Option<String>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate the database to a newer schema version
    ApplySchema {
        #[command(flatten)]
        target: TargetArgs,

        /// Skip waiting for live instances to reach the previous version.
        /// Fleet compatibility is still enforced.
        #[arg(long)]
        force: bool,
    },
    /// Show which version each live instance last observed
    CurrentSchema,
    /// Show the versions the catalog offers from the current one upward
    AvailableSchema,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct TargetArgs {
    /// The version right after the current one
    #[arg(long)]
    next: bool,
    /// The newest version the catalog offers
    #[arg(long)]
    latest: bool,
    /// A specific version
    #[arg(long, value_name = "N")]
    version: Option<i32>,
}

impl TargetArgs {
    fn selector(&self) -> fleetschema_migrate::TargetSelector {
        use fleetschema_migrate::TargetSelector;
        match (self.next, self.latest, self.version) {
            (_, _, Some(v)) => TargetSelector::Explicit(v),
            (_, true, None) => TargetSelector::Latest,
            _ => TargetSelector::Next,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleetschema=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::ApplySchema { target, force } => {
            commands::apply::apply_schema(&cli.global, target.selector(), force).await
        }
        Commands::CurrentSchema => commands::show::current_schema(&cli.global).await,
        Commands::AvailableSchema => commands::show::available_schema(&cli.global).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "command failed");
            ExitCode::FAILURE
        }
    }
}
