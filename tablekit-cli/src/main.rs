//! tablekit CLI - ad-hoc access to partitioned key-value tables
//!
//! Settings come from ~/.tablekit/config.toml, then `.env` files and
//! `TABLEKIT_*` variables, then the global flags below (highest priority).
//! Entities are schema-less JSON objects keyed by `partitionKey` / `rowKey`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tablekit_core::config::load_dotenv;
use tablekit_core::{DynamicEntity, RepoError, TableConfig, TableRepository};
use tablekit_http::{HttpBackend, HttpOptions};
use tracing::debug;

mod commands;
mod tracing_setup;

use commands::entity::{CreateArgs, KeyArgs, ListArgs, UpdateArgs};
use commands::table::TableArgs;
use tracing_setup::{init_tracing, TracingConfig};

#[derive(Parser, Debug)]
#[command(
    name = "tablekit",
    author,
    version,
    about = "Read and write entities in partitioned key-value tables",
    long_about = "Typed CRUD over an Azure-Table-compatible store. Errors from the store are \
                  reported as `code (status): message`."
)]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(long, global = true)]
    debug: bool,

    /// Connection string (overrides TABLEKIT_CONNECTION_STRING)
    #[arg(long, global = true)]
    connection_string: Option<String>,

    /// Table to operate on (overrides TABLEKIT_TABLE)
    #[arg(long, short = 't', global = true)]
    table: Option<String>,

    /// Permit plain-http endpoints other than local development storage
    #[arg(long, global = true)]
    allow_insecure: bool,

    /// Config file to read instead of ~/.tablekit/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Table provisioning (create, delete)
    Table(TableArgs),
    /// Fetch one entity by partition and row key
    Get(KeyArgs),
    /// List entities, optionally filtered
    List(ListArgs),
    /// Insert a new entity
    Create(CreateArgs),
    /// Merge properties into an existing entity
    Update(UpdateArgs),
    /// Delete one entity
    Delete(KeyArgs),
}

fn load_config(cli: &Cli) -> Result<TableConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = TableConfig::load_from(path)?;
            config.apply_env();
            config
        }
        None => TableConfig::load()?,
    };

    if let Some(connection_string) = &cli.connection_string {
        config.connection_string = Some(connection_string.clone());
    }
    if let Some(table) = &cli.table {
        config.table_name = Some(table.clone());
    }
    if cli.allow_insecure {
        config.allow_insecure_connection = true;
    }
    // `table create NAME` / `table delete NAME` work without a configured table
    if config.table_name.is_none() {
        if let Commands::Table(args) = &cli.command {
            config.table_name = args.command.target().map(str::to_string);
        }
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let backend = Arc::new(HttpBackend::new(HttpOptions::from(&config)));
    let repo: TableRepository<DynamicEntity> = TableRepository::from_config(backend, &config)?;
    debug!(connections = ?repo.connections(), "repository ready");

    match cli.command {
        Commands::Table(args) => commands::run_table(&repo, args).await,
        Commands::Get(args) => commands::run_get(&repo, args).await,
        Commands::List(args) => commands::run_list(&repo, args).await,
        Commands::Create(args) => commands::run_create(&repo, args).await,
        Commands::Update(args) => commands::run_update(&repo, args).await,
        Commands::Delete(args) => commands::run_delete(&repo, args).await,
    }
}

/// Store errors get the compact `code (status): message` form.
fn report(err: &anyhow::Error) {
    match err.downcast_ref::<RepoError>().and_then(RepoError::domain) {
        Some(domain) => eprintln!(
            "{} ({}): {}",
            domain.code, domain.status_code, domain.message
        ),
        None => eprintln!("Error: {err:#}"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    load_dotenv();
    init_tracing(TracingConfig { debug: cli.debug }).ok();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_table_name_falls_back_to_table_command_target() {
        let cli = Cli::parse_from([
            "tablekit",
            "--config",
            "/nonexistent/tablekit.toml",
            "table",
            "create",
            "invoices",
        ]);
        // Missing explicit config file is a read error, not a silent default
        assert!(load_config(&cli).is_err());

        let cli = Cli::parse_from(["tablekit", "table", "delete", "invoices"]);
        if let Commands::Table(args) = &cli.command {
            assert_eq!(args.command.target(), Some("invoices"));
        } else {
            panic!("expected table command");
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "tablekit",
            "get",
            "eu",
            "1",
            "--table",
            "orders",
            "--allow-insecure",
        ]);
        assert_eq!(cli.table.as_deref(), Some("orders"));
        assert!(cli.allow_insecure);
    }
}
