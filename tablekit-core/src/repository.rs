//! Generic CRUD repository over one table.
//!
//! Handles come from the shared [`ConnectionManager`]; every backend failure
//! goes through [`classify`] before it reaches the caller. Nothing here
//! retries: callers decide from [`DomainError::code`](crate::DomainError).

use std::marker::PhantomData;
use std::sync::Arc;

use futures::TryStreamExt;
use tracing::{debug, instrument, warn};

use crate::backend::{BackendFactory, DeleteResult, ListOptions, UpdateMode};
use crate::classify::classify;
use crate::config::{ConfigError, TableConfig};
use crate::connection::ConnectionManager;
use crate::entity::{self, CompositeKey, EntityPatch, MappingError, TableEntity};
use crate::error::{BackendError, ErrorCode, RepoError, Result};

/// Feature switches, fixed when the repository is built
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepositoryOptions {
    /// Provision the table before every `create`
    pub create_table_if_not_exists: bool,
    /// Page size requested from the backend by `find_all`
    pub page_size: Option<u32>,
}

impl From<&TableConfig> for RepositoryOptions {
    fn from(config: &TableConfig) -> Self {
        Self {
            create_table_if_not_exists: config.create_table_if_not_exists,
            page_size: config.page_size,
        }
    }
}

pub struct TableRepository<T> {
    connections: Arc<ConnectionManager>,
    options: RepositoryOptions,
    _entity: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for TableRepository<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableRepository")
            .field("connections", &self.connections)
            .field("options", &self.options)
            .finish()
    }
}

impl<T> Clone for TableRepository<T> {
    fn clone(&self) -> Self {
        Self {
            connections: Arc::clone(&self.connections),
            options: self.options,
            _entity: PhantomData,
        }
    }
}

impl<T: TableEntity> TableRepository<T> {
    pub fn new(connections: Arc<ConnectionManager>, options: RepositoryOptions) -> Self {
        Self {
            connections,
            options,
            _entity: PhantomData,
        }
    }

    /// Build the manager and repository from loaded configuration.
    pub fn from_config(
        factory: Arc<dyn BackendFactory>,
        config: &TableConfig,
    ) -> std::result::Result<Self, ConfigError> {
        let connections = ConnectionManager::from_config(factory, config)?;
        Ok(Self::new(Arc::new(connections), RepositoryOptions::from(config)))
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn options(&self) -> RepositoryOptions {
        self.options
    }

    fn table_name(&self) -> &str {
        self.connections.table_name()
    }

    fn fail(&self, raw: BackendError, table_name: &str) -> RepoError {
        let err = classify(raw, table_name);
        match &err {
            RepoError::Domain(domain) => debug!(
                code = %domain.code,
                status = domain.status_code,
                "backend rejected request"
            ),
            other => warn!(error = %other, "backend call failed"),
        }
        err
    }

    /// Provision a table; defaults to the repository's own table.
    ///
    /// An existing table is reported as a `TableAlreadyExists` domain error,
    /// not swallowed: treat that code as success when idempotence is wanted.
    #[instrument(skip_all, fields(table))]
    pub async fn create_table_if_not_exists(&self, table_name: Option<&str>) -> Result<bool> {
        let table = table_name.unwrap_or_else(|| self.table_name());
        tracing::Span::current().record("table", table);

        let service = self.connections.service_handle()?;
        service
            .create_table(table)
            .await
            .map_err(|raw| self.fail(raw, table))?;

        debug!("table provisioned");
        Ok(true)
    }

    /// Point lookup. `None` when the entity does not exist or maps to nothing.
    #[instrument(
        skip_all,
        fields(table = %self.table_name(), partition_key = %partition_key, row_key = %row_key)
    )]
    pub async fn find(&self, partition_key: &str, row_key: &str) -> Result<Option<T>> {
        let key = CompositeKey::new(partition_key, row_key)?;
        let client = self.connections.entity_handle()?;

        match client.get_entity(key.partition_key(), key.row_key()).await {
            Ok(raw) => Ok(entity::from_record(raw)?),
            Err(raw) => match self.fail(raw, self.table_name()) {
                RepoError::Domain(err) if err.kind() == ErrorCode::ResourceNotFound => Ok(None),
                err => Err(err),
            },
        }
    }

    /// Every entity matching `filter`, in backend order.
    ///
    /// The filter is handed to the backend as-is.
    pub async fn find_all(&self, filter: Option<&str>) -> Result<Vec<T>> {
        self.find_all_with(ListOptions {
            filter: filter.map(str::to_string),
            page_size: self.options.page_size,
        })
        .await
    }

    /// [`Self::find_all`] with explicit listing options.
    #[instrument(skip_all, fields(table = %self.table_name(), filter = ?options.filter))]
    pub async fn find_all_with(&self, options: ListOptions) -> Result<Vec<T>> {
        let client = self.connections.entity_handle()?;
        let mut records = client.list_entities(options);

        let mut entities = Vec::new();
        while let Some(raw) = records
            .try_next()
            .await
            .map_err(|raw| self.fail(raw, self.table_name()))?
        {
            if let Some(entity) = entity::from_record(raw)? {
                entities.push(entity);
            }
        }

        debug!(count = entities.len(), "listing drained");
        Ok(entities)
    }

    /// Insert a new entity, provisioning the table first when configured to.
    #[instrument(skip_all, fields(table = %self.table_name()))]
    pub async fn create(&self, entity: &T) -> Result<Option<T>> {
        if self.options.create_table_if_not_exists {
            match self.create_table_if_not_exists(None).await {
                Ok(_) => {}
                Err(RepoError::Domain(err)) if err.is_table_already_exists() => {}
                Err(err) => return Err(err),
            }
        }

        let record = entity::to_record(entity)?;
        let client = self.connections.entity_handle()?;
        let created = client
            .create_entity(record)
            .await
            .map_err(|raw| self.fail(raw, self.table_name()))?;

        Ok(entity::from_record(created)?)
    }

    /// Merge `patch` into the entity at (`partition_key`, `row_key`).
    ///
    /// Key slots the patch leaves empty are filled from the arguments.
    #[instrument(
        skip_all,
        fields(table = %self.table_name(), partition_key = %partition_key, row_key = %row_key)
    )]
    pub async fn update(&self, partition_key: &str, row_key: &str, patch: EntityPatch) -> Result<T> {
        let key = CompositeKey::new(partition_key, row_key)?;
        let record = patch.without_metadata::<T>().into_record(&key);
        let client = self.connections.entity_handle()?;

        let updated = client
            .update_entity(record, UpdateMode::Merge)
            .await
            .map_err(|raw| self.fail(raw, self.table_name()))?;

        entity::from_record(updated)?.ok_or(RepoError::Mapping(MappingError::EmptyResult))
    }

    /// Unconditional delete; the backend's response is returned untouched.
    #[instrument(
        skip_all,
        fields(table = %self.table_name(), partition_key = %partition_key, row_key = %row_key)
    )]
    pub async fn delete(&self, partition_key: &str, row_key: &str) -> Result<DeleteResult> {
        let key = CompositeKey::new(partition_key, row_key)?;
        let client = self.connections.entity_handle()?;

        client
            .delete_entity(key.partition_key(), key.row_key())
            .await
            .map_err(|raw| self.fail(raw, self.table_name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ClientOptions, TableClient, TableServiceClient};
    use crate::config::ConnectionConfig;
    use crate::entity::Record;
    use crate::memory::InMemoryBackend;
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream, StreamExt};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Order {
        partition_key: String,
        row_key: String,
        total: f64,
    }

    impl TableEntity for Order {}

    /// Backend whose entity handle answers every call with fixed results.
    struct FixedBackend {
        get: std::result::Result<Record, BackendError>,
    }

    #[async_trait]
    impl TableServiceClient for FixedBackend {
        async fn create_table(&self, _name: &str) -> std::result::Result<(), BackendError> {
            Err(BackendError::transport("connection refused"))
        }

        async fn delete_table(&self, _name: &str) -> std::result::Result<(), BackendError> {
            Ok(())
        }
    }

    #[async_trait]
    impl TableClient for FixedBackend {
        fn table_name(&self) -> &str {
            "orders"
        }

        async fn get_entity(
            &self,
            _partition_key: &str,
            _row_key: &str,
        ) -> std::result::Result<Record, BackendError> {
            self.get.clone()
        }

        fn list_entities(
            &self,
            _options: ListOptions,
        ) -> BoxStream<'_, std::result::Result<Record, BackendError>> {
            stream::iter(vec![self.get.clone()]).boxed()
        }

        async fn create_entity(&self, entity: Record) -> std::result::Result<Record, BackendError> {
            Ok(entity)
        }

        async fn update_entity(
            &self,
            _entity: Record,
            _mode: UpdateMode,
        ) -> std::result::Result<Record, BackendError> {
            self.get.clone()
        }

        async fn delete_entity(
            &self,
            _partition_key: &str,
            _row_key: &str,
        ) -> std::result::Result<DeleteResult, BackendError> {
            Ok(DeleteResult::default())
        }
    }

    struct FixedFactory(Arc<FixedBackend>);

    impl BackendFactory for FixedFactory {
        fn service_client(
            &self,
            _connection: &ConnectionConfig,
            _options: ClientOptions,
        ) -> std::result::Result<Arc<dyn TableServiceClient>, ConfigError> {
            Ok(self.0.clone())
        }

        fn table_client(
            &self,
            _connection: &ConnectionConfig,
            _table_name: &str,
            _options: ClientOptions,
        ) -> std::result::Result<Arc<dyn TableClient>, ConfigError> {
            Ok(self.0.clone())
        }
    }

    fn fixed_repo(
        get: std::result::Result<Record, BackendError>,
        options: RepositoryOptions,
    ) -> TableRepository<Order> {
        let factory = Arc::new(FixedFactory(Arc::new(FixedBackend { get })));
        let connections = ConnectionManager::new(
            factory,
            ConnectionConfig::development_storage(),
            "orders",
            false,
        );
        TableRepository::new(Arc::new(connections), options)
    }

    fn memory_repo(options: RepositoryOptions) -> TableRepository<Order> {
        let connections = ConnectionManager::new(
            Arc::new(InMemoryBackend::new()),
            ConnectionConfig::development_storage(),
            "orders",
            false,
        );
        TableRepository::new(Arc::new(connections), options)
    }

    fn metadata_only() -> Record {
        match json!({ "odata.etag": "W/\"1\"", "Timestamp": "2024-05-01T10:00:00Z" }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_find_maps_metadata_only_record_to_none() {
        let repo = fixed_repo(Ok(metadata_only()), RepositoryOptions::default());
        assert!(repo.find("eu", "1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_all_skips_empty_records() {
        let repo = fixed_repo(Ok(metadata_only()), RepositoryOptions::default());
        assert!(repo.find_all(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_with_empty_result_is_mapping_error() {
        let repo = fixed_repo(Ok(metadata_only()), RepositoryOptions::default());
        let err = repo
            .update("eu", "1", EntityPatch::new().set("total", 1.0).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Mapping(MappingError::EmptyResult)));
    }

    #[tokio::test]
    async fn test_transport_failure_is_not_classified() {
        let repo = fixed_repo(
            Err(BackendError::transport("dns error: no such host")),
            RepositoryOptions::default(),
        );
        match repo.find("eu", "1").await.unwrap_err() {
            RepoError::Transport(err) => assert_eq!(err.message, "dns error: no such host"),
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_stops_when_provisioning_fails() {
        let repo = fixed_repo(
            Ok(metadata_only()),
            RepositoryOptions {
                create_table_if_not_exists: true,
                page_size: None,
            },
        );
        let order = Order {
            partition_key: "eu".into(),
            row_key: "1".into(),
            total: 1.0,
        };
        assert!(matches!(
            repo.create(&order).await.unwrap_err(),
            RepoError::Transport(_)
        ));
    }

    #[tokio::test]
    async fn test_empty_key_is_rejected_before_backend() {
        let repo = memory_repo(RepositoryOptions::default());
        assert!(matches!(
            repo.find("", "1").await.unwrap_err(),
            RepoError::Mapping(MappingError::EmptyKey { .. })
        ));
        assert!(matches!(
            repo.delete("eu", "").await.unwrap_err(),
            RepoError::Mapping(MappingError::EmptyKey { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_provisions_table_repeatedly() {
        let repo = memory_repo(RepositoryOptions {
            create_table_if_not_exists: true,
            page_size: None,
        });
        for row in ["1", "2"] {
            let order = Order {
                partition_key: "eu".into(),
                row_key: row.into(),
                total: 2.5,
            };
            let created = repo.create(&order).await.unwrap();
            assert_eq!(created, Some(order));
        }
    }

    #[tokio::test]
    async fn test_create_without_table_reports_table_not_found() {
        let repo = memory_repo(RepositoryOptions::default());
        let order = Order {
            partition_key: "eu".into(),
            row_key: "1".into(),
            total: 2.5,
        };
        let err = repo.create(&order).await.unwrap_err();
        let domain = err.domain().expect("domain error");
        assert_eq!(domain.code, "TableNotFound");
        assert_eq!(domain.status_code, 404);
        assert_eq!(
            domain.message,
            "Error creating entity. Table orders Not Found. Is it created?"
        );
    }
}
