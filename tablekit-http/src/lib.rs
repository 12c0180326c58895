//! Azure Table REST backend for tablekit.
//!
//! [`HttpBackend`] is a [`BackendFactory`]: hand it to a
//! [`ConnectionManager`](tablekit_core::ConnectionManager) and the handles it
//! builds talk JSON-light to the table endpoint from the connection string.

mod auth;
mod client;

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use url::Url;

use tablekit_core::{
    BackendFactory, ClientOptions, ConfigError, ConnectionConfig, TableClient, TableConfig,
    TableServiceClient,
};

pub use client::{HttpServiceClient, HttpTableClient};

use auth::Signer;
use client::Endpoint;

/// reqwest client settings shared by every handle a backend builds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpOptions {
    /// Whole-request timeout; none when unset
    pub timeout: Option<Duration>,
}

impl From<&TableConfig> for HttpOptions {
    fn from(config: &TableConfig) -> Self {
        Self {
            timeout: config.request_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpBackend {
    options: HttpOptions,
}

impl HttpBackend {
    pub fn new(options: HttpOptions) -> Self {
        Self { options }
    }

    fn endpoint(
        &self,
        connection: &ConnectionConfig,
        options: ClientOptions,
    ) -> Result<Arc<Endpoint>, ConfigError> {
        connection.check_transport(options)?;

        let base = Url::parse(&connection.table_endpoint).map_err(|e| {
            ConfigError::InvalidConnectionString {
                reason: format!("bad table endpoint '{}': {e}", connection.table_endpoint),
            }
        })?;
        let signer = Signer::from_connection(connection)?;

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = self.options.timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(|e| ConfigError::Client {
            reason: e.to_string(),
        })?;

        debug!(endpoint = %base, signer = ?signer, "http endpoint ready");
        Ok(Arc::new(Endpoint { http, base, signer }))
    }
}

impl BackendFactory for HttpBackend {
    fn service_client(
        &self,
        connection: &ConnectionConfig,
        options: ClientOptions,
    ) -> Result<Arc<dyn TableServiceClient>, ConfigError> {
        let endpoint = self.endpoint(connection, options)?;
        Ok(Arc::new(HttpServiceClient::new(endpoint)))
    }

    fn table_client(
        &self,
        connection: &ConnectionConfig,
        table_name: &str,
        options: ClientOptions,
    ) -> Result<Arc<dyn TableClient>, ConfigError> {
        let endpoint = self.endpoint(connection, options)?;
        Ok(Arc::new(HttpTableClient::new(endpoint, table_name)))
    }
}
