//! `tablekit table ...`: table provisioning.

use anyhow::Result;
use clap::{Args, Subcommand};
use serde_json::json;
use tracing::info;

use tablekit_core::{classify, DynamicEntity, TableRepository};

use super::print_json;

#[derive(Args, Debug)]
pub struct TableArgs {
    #[command(subcommand)]
    pub command: TableCommands,
}

#[derive(Subcommand, Debug)]
pub enum TableCommands {
    /// Create a table (defaults to the configured table)
    Create {
        /// Table name
        name: Option<String>,
    },
    /// Delete a table
    Delete {
        /// Table name
        name: String,
    },
}

impl TableCommands {
    /// Table this command acts on when none is configured.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Create { name } => name.as_deref(),
            Self::Delete { name } => Some(name),
        }
    }
}

pub async fn run_table(repo: &TableRepository<DynamicEntity>, args: TableArgs) -> Result<()> {
    match args.command {
        TableCommands::Create { name } => {
            let created = repo.create_table_if_not_exists(name.as_deref()).await?;
            let table = name.as_deref().unwrap_or(repo.connections().table_name());
            info!(table, "table created");
            print_json(&json!({ "table": table, "created": created }))
        }
        TableCommands::Delete { name } => {
            let service = repo.connections().service_handle()?;
            service
                .delete_table(&name)
                .await
                .map_err(|raw| classify(raw, &name))?;
            info!(table = %name, "table deleted");
            print_json(&json!({ "table": name, "deleted": true }))
        }
    }
}
