pub mod backend;
pub mod classify;
pub mod config;
pub mod connection;
pub mod entity;
pub mod error;
pub mod memory;
pub mod repository;

pub use backend::{
    BackendFactory, ClientOptions, DeleteResult, ListOptions, TableClient, TableServiceClient,
    UpdateMode,
};
pub use classify::classify;
pub use config::{ConfigError, ConnectionConfig, Credential, TableConfig};
pub use connection::ConnectionManager;
pub use entity::{CompositeKey, DynamicEntity, EntityPatch, MappingError, Record, TableEntity};
pub use error::{BackendError, DomainError, ErrorCode, RepoError, Result};
pub use memory::InMemoryBackend;
pub use repository::{RepositoryOptions, TableRepository};
