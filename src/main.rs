//! CensusGate server binary.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use censusgate::bootstrap;
use censusgate::catalog::SchemaCatalog;
use censusgate::config::Config;
use censusgate::validator::SqlValidator;

#[derive(Debug, Parser)]
#[command(name = "censusgate", version, about = "Natural-language analytics gateway over U.S. Census demographics")]
struct Cli {
    /// Optional TOML config file overlaid below environment variables.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the protocol server (default).
    Serve,
    /// Validate a SQL statement offline; reads stdin when no argument given.
    Validate {
        /// The candidate SQL. Reads stdin when omitted.
        sql: Option<String>,
    },
    /// Check database, pool, credentials, and the audit sink.
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    bootstrap::init_tracing();

    let config = Config::from_env_with_toml(cli.config.as_deref())
        .context("failed to load configuration")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            bootstrap::run(config).await.context("server failed")?;
        }
        Command::Validate { sql } => {
            let sql = match sql {
                Some(sql) => sql,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("failed to read SQL from stdin")?;
                    buf
                }
            };
            let validator =
                SqlValidator::new(Arc::new(SchemaCatalog::acs()), config.validator);
            let result = validator.validate(&sql);
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_accepted() {
                std::process::exit(1);
            }
        }
        Command::Doctor => {
            if !bootstrap::doctor(&config).await {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
