//! Entity commands: `get`, `list`, `create`, `update`, `delete`.

use anyhow::{bail, Context, Result};
use clap::Args;
use serde_json::Value;
use tracing::debug;

use tablekit_core::{DynamicEntity, EntityPatch, TableRepository};

use super::print_json;

#[derive(Args, Debug)]
pub struct KeyArgs {
    /// Partition key
    pub partition_key: String,
    /// Row key
    pub row_key: String,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Store filter expression, e.g. "PartitionKey eq 'eu'"
    #[arg(long, short = 'f')]
    pub filter: Option<String>,
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Entity as a JSON object, including partitionKey and rowKey
    pub json: String,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    #[command(flatten)]
    pub key: KeyArgs,
    /// Properties to merge, as a JSON object
    pub json: String,
}

fn parse_object(raw: &str) -> Result<serde_json::Map<String, Value>> {
    match serde_json::from_str(raw).context("Entity argument is not valid JSON")? {
        Value::Object(fields) => Ok(fields),
        other => bail!("Entity argument must be a JSON object, got {other}"),
    }
}

pub async fn run_get(repo: &TableRepository<DynamicEntity>, args: KeyArgs) -> Result<()> {
    match repo.find(&args.partition_key, &args.row_key).await? {
        Some(entity) => print_json(&entity),
        None => bail!(
            "No entity at ({}, {})",
            args.partition_key,
            args.row_key
        ),
    }
}

pub async fn run_list(repo: &TableRepository<DynamicEntity>, args: ListArgs) -> Result<()> {
    let entities = repo.find_all(args.filter.as_deref()).await?;
    debug!(count = entities.len(), "listed entities");
    print_json(&entities)
}

pub async fn run_create(repo: &TableRepository<DynamicEntity>, args: CreateArgs) -> Result<()> {
    let entity = DynamicEntity(parse_object(&args.json)?);
    let created = repo.create(&entity).await?;
    print_json(&created)
}

pub async fn run_update(repo: &TableRepository<DynamicEntity>, args: UpdateArgs) -> Result<()> {
    let patch = EntityPatch::from_serialize(&Value::Object(parse_object(&args.json)?))?;
    let updated = repo
        .update(&args.key.partition_key, &args.key.row_key, patch)
        .await?;
    print_json(&updated)
}

pub async fn run_delete(repo: &TableRepository<DynamicEntity>, args: KeyArgs) -> Result<()> {
    let result = repo.delete(&args.partition_key, &args.row_key).await?;
    print_json(&result)
}
