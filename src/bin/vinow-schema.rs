#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod commands;

use clap::{Parser, Subcommand};
use tracing::Level;
use vinow_schema::{OutputFormat, VinowConfig};

use commands::apply::ApplyArgs;
use commands::policies::PoliciesArgs;
use commands::verify::VerifyArgs;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    /// configuration file path, by default $HOME/.vinow/vinow.toml is used
    #[clap(short, long, global = true)]
    config: Option<String>,

    /// Print debug information
    #[clap(long, global = true)]
    debug: bool,

    /// Output format: table, markdown, json, json-pretty
    #[clap(short, long, global = true, default_value = "table")]
    format: OutputFormat,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Converge the database to a schema plan (safe to repeat)
    Apply(ApplyArgs),

    /// Show the schema version, status and migration ledger
    Status,

    /// Check tables, timestamp triggers and access policies
    Verify(VerifyArgs),

    /// List row-level access policies
    Policies(PoliciesArgs),

    /// Show the effective configuration
    Config,

    /// Validate configuration, probe the cache, create media directories and apply the schema
    Prepare,
}

fn main() {
    let cli = Cli::parse();

    let config = match VinowConfig::new(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
    };

    let level = if cli.debug {
        Level::DEBUG
    } else {
        config.log_level.parse().unwrap_or(Level::INFO)
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Apply(args) => commands::apply::run(&config, args, cli.format),
        Commands::Status => commands::status::run(&config, cli.format),
        Commands::Verify(args) => commands::verify::run(&config, args, cli.format),
        Commands::Policies(args) => commands::policies::run(&config, args, cli.format),
        Commands::Config => commands::config::run(&config, cli.format),
        Commands::Prepare => commands::prepare::run(&config, cli.format),
    }
}
