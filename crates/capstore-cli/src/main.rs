//! capstore CLI
//!
//! Operator tool for a capstore deployment: a set of SQLite shards plus the
//! durable shard registry that says which one takes new writes.
//!
//! ## Quick Start
//!
//! ```bash
//! # Create the registry and shard-0001
//! capstore init
//!
//! # Keep the capacity monitor and provisioner running
//! capstore run
//!
//! # Inspect shards and usage
//! capstore status
//! capstore status -o json
//!
//! # Store and find applicants
//! capstore put --name "Ada Lovelace" --email ada@example.com
//! capstore get CAND-0001
//! capstore query --email ada@example.com
//! ```
//!
//! ## Configuration
//!
//! - `--config <path>` / `CAPSTORE_CONFIG`: optional TOML file
//! - `--output table|json|text` / `CAPSTORE_OUTPUT`: output format (default `table`)
//! - `--no-color`, or `NO_COLOR`: plain output; color is also off when stdout is
//!   not a terminal
//! - `CAPSTORE_*` variables override individual settings
//! - `RUST_LOG` controls log verbosity (default `info`, written to stderr)

use anyhow::{Context, Result};
use capstore_core::CapstoreConfig;
use clap::{ArgGroup, Parser, Subcommand};
use format::{Formatter, OutputFormat};
use std::io::IsTerminal;
use std::path::PathBuf;

mod commands;
mod format;

#[derive(Parser)]
#[command(name = "capstore")]
#[command(about = "Capacity-aware sharded applicant store", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "CAPSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(
        short,
        long,
        global = true,
        value_enum,
        env = "CAPSTORE_OUTPUT",
        default_value_t = OutputFormat::Table
    )]
    output: OutputFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the shard registry with its first shard
    Init,
    /// Run the capacity monitor and shard provisioner until Ctrl+C
    Run,
    /// Show every shard, its role and usage
    Status,
    /// Probe every shard once and record usage
    Refresh,
    /// Provision a new write target now
    Provision,
    /// Rebuild the registry from its log and check it against the snapshot
    Replay,
    /// Store a new applicant on the current write target
    Put {
        /// Candidate id (default: next free CAND-NNNN)
        #[arg(long)]
        id: Option<String>,
        #[command(flatten)]
        fields: commands::RecordFields,
    },
    /// Edit an existing applicant on its home shard
    Update {
        /// Candidate id
        id: String,
        #[command(flatten)]
        fields: commands::RecordFields,
    },
    /// Fetch one applicant by candidate id
    Get {
        /// Candidate id
        id: String,
    },
    /// Search applicants across all shards
    #[command(group(ArgGroup::new("filter").args(["email", "name", "created_by"])))]
    Query {
        /// Exact email (case-insensitive)
        #[arg(long)]
        email: Option<String>,
        /// Substring of the name (case-insensitive)
        #[arg(long)]
        name: Option<String>,
        /// Records created by this user
        #[arg(long)]
        created_by: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config =
        CapstoreConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let out = Formatter::new(
        cli.output,
        !cli.no_color && std::io::stdout().is_terminal(),
    );

    match cli.command {
        Commands::Init => commands::init(&config, &out).await?,
        Commands::Run => commands::run(&config).await?,
        Commands::Status => commands::status(&config, &out).await?,
        Commands::Refresh => commands::refresh(&config, &out).await?,
        Commands::Provision => commands::provision(&config, &out).await?,
        Commands::Replay => commands::replay(&config, &out).await?,
        Commands::Put { id, fields } => commands::put(&config, &out, id, fields).await?,
        Commands::Update { id, fields } => commands::update(&config, &out, id, fields).await?,
        Commands::Get { id } => commands::get(&config, &out, &id).await?,
        Commands::Query {
            email,
            name,
            created_by,
        } => {
            let query = commands::build_query(email, name, created_by);
            commands::query(&config, &out, query).await?
        }
    }

    Ok(())
}
