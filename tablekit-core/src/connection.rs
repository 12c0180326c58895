//! Lazy, memoized backend handles.
//!
//! One [`ConnectionManager`] owns at most one service handle and one table
//! handle for a (connection, table) pair. Each is guarded by its own
//! `OnceCell`, so concurrent first calls still construct it exactly once.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::backend::{BackendFactory, ClientOptions, TableClient, TableServiceClient};
use crate::config::{ConfigError, ConnectionConfig, TableConfig};

pub struct ConnectionManager {
    factory: Arc<dyn BackendFactory>,
    connection: ConnectionConfig,
    table_name: String,
    allow_insecure_connection: bool,
    service: OnceCell<Arc<dyn TableServiceClient>>,
    table: OnceCell<Arc<dyn TableClient>>,
}

impl ConnectionManager {
    /// No handle is built here; see [`Self::service_handle`] / [`Self::entity_handle`].
    pub fn new(
        factory: Arc<dyn BackendFactory>,
        connection: ConnectionConfig,
        table_name: impl Into<String>,
        allow_insecure_connection: bool,
    ) -> Self {
        Self {
            factory,
            connection,
            table_name: table_name.into(),
            allow_insecure_connection,
            service: OnceCell::new(),
            table: OnceCell::new(),
        }
    }

    pub fn from_config(
        factory: Arc<dyn BackendFactory>,
        config: &TableConfig,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(
            factory,
            config.connection()?,
            config.table_name()?,
            config.allow_insecure_connection,
        ))
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn connection(&self) -> &ConnectionConfig {
        &self.connection
    }

    /// Table administration handle, built on first use.
    pub fn service_handle(&self) -> Result<Arc<dyn TableServiceClient>, ConfigError> {
        self.service
            .get_or_try_init(|| {
                debug!(endpoint = %self.connection.table_endpoint, "building service handle");
                self.factory
                    .service_client(&self.connection, ClientOptions::default())
            })
            .cloned()
    }

    /// Entity handle for the configured table, built on first use.
    pub fn entity_handle(&self) -> Result<Arc<dyn TableClient>, ConfigError> {
        self.table
            .get_or_try_init(|| {
                debug!(
                    endpoint = %self.connection.table_endpoint,
                    table = %self.table_name,
                    allow_insecure = self.allow_insecure_connection,
                    "building table handle"
                );
                self.factory.table_client(
                    &self.connection,
                    &self.table_name,
                    ClientOptions {
                        allow_insecure_connection: self.allow_insecure_connection,
                    },
                )
            })
            .cloned()
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connection", &self.connection)
            .field("table_name", &self.table_name)
            .field("allow_insecure_connection", &self.allow_insecure_connection)
            .field("service_ready", &self.service.get().is_some())
            .field("table_ready", &self.table.get().is_some())
            .finish()
    }
}
