//! Table store capability traits.
//!
//! A backend supplies two handle kinds: a service handle for table
//! administration and a table handle for entity operations. Both report
//! failures as raw [`BackendError`]s; classification happens in the repository.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, ConnectionConfig};
use crate::entity::Record;
use crate::error::BackendError;

/// Construction-time policy for a backend handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientOptions {
    /// Permit plain `http` endpoints (local emulators, dev backends)
    pub allow_insecure_connection: bool,
}

/// Listing options passed to the backend untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Store filter expression (e.g. `PartitionKey eq 'eu'`)
    pub filter: Option<String>,
    /// Entities requested per page; the backend picks when unset
    pub page_size: Option<u32>,
}

impl ListOptions {
    pub fn filter(filter: impl Into<String>) -> Self {
        Self {
            filter: Some(filter.into()),
            page_size: None,
        }
    }
}

/// How an update combines with the stored entity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdateMode {
    /// Overwrite only the properties present in the update
    #[default]
    Merge,
    /// Replace the stored entity entirely
    Replace,
}

/// Backend response to a delete, passed through to callers as-is
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResult {
    pub status_code: u16,
    pub etag: Option<String>,
    pub request_id: Option<String>,
    pub date: Option<String>,
}

/// Table administration handle
#[async_trait]
pub trait TableServiceClient: Send + Sync {
    async fn create_table(&self, name: &str) -> Result<(), BackendError>;

    async fn delete_table(&self, name: &str) -> Result<(), BackendError>;
}

/// Entity handle scoped to one table
#[async_trait]
pub trait TableClient: Send + Sync {
    fn table_name(&self) -> &str;

    async fn get_entity(&self, partition_key: &str, row_key: &str)
        -> Result<Record, BackendError>;

    /// Lazily page through matching entities.
    fn list_entities(&self, options: ListOptions) -> BoxStream<'_, Result<Record, BackendError>>;

    async fn create_entity(&self, entity: Record) -> Result<Record, BackendError>;

    /// Write `entity` and return the stored entity after the update.
    async fn update_entity(
        &self,
        entity: Record,
        mode: UpdateMode,
    ) -> Result<Record, BackendError>;

    async fn delete_entity(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<DeleteResult, BackendError>;
}

/// Builds backend handles from connection configuration.
///
/// Construction must stay cheap: no I/O happens until a handle is used.
pub trait BackendFactory: Send + Sync {
    fn service_client(
        &self,
        connection: &ConnectionConfig,
        options: ClientOptions,
    ) -> Result<Arc<dyn TableServiceClient>, ConfigError>;

    fn table_client(
        &self,
        connection: &ConnectionConfig,
        table_name: &str,
        options: ClientOptions,
    ) -> Result<Arc<dyn TableClient>, ConfigError>;
}
