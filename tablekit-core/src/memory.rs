//! In-process table store.
//!
//! Behaves like the remote store where the repository can observe it: the
//! same JSON error bodies and codes, ETag and `Timestamp` metadata on every
//! read, and paged listings. Backs the test suites.
//!
//! Filters support the `<Property> eq <literal>` form joined with `and`;
//! anything else is rejected with `InvalidInput`, as the store would for a
//! malformed expression.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::backend::{
    BackendFactory, ClientOptions, DeleteResult, ListOptions, TableClient, TableServiceClient,
    UpdateMode,
};
use crate::config::{ConfigError, ConnectionConfig};
use crate::entity::{CompositeKey, Record, WIRE_PARTITION_KEY, WIRE_ROW_KEY};
use crate::error::BackendError;

/// Page size when the caller does not ask for one (matches the store's cap).
pub const DEFAULT_PAGE_SIZE: usize = 1000;

static TABLE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9]{2,62}$").expect("valid regex"));
static AND_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\s+and\s+").expect("valid regex"));
static CLAUSE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*([A-Za-z_][A-Za-z0-9_]*)\s+eq\s+(?:'((?:[^']|'')*)'|(\S+))\s*$")
        .expect("valid regex")
});

type Rows = BTreeMap<CompositeKey, StoredEntity>;

#[derive(Debug, Clone)]
struct StoredEntity {
    properties: Record,
    etag: String,
    timestamp: String,
}

impl StoredEntity {
    fn to_wire(&self, key: &CompositeKey) -> Record {
        let mut record = Record::new();
        record.insert("odata.etag".to_string(), Value::String(self.etag.clone()));
        record.insert(
            WIRE_PARTITION_KEY.to_string(),
            Value::String(key.partition_key().to_string()),
        );
        record.insert(
            WIRE_ROW_KEY.to_string(),
            Value::String(key.row_key().to_string()),
        );
        record.insert(
            "Timestamp".to_string(),
            Value::String(self.timestamp.clone()),
        );
        for (name, value) in &self.properties {
            record.insert(name.clone(), value.clone());
        }
        record
    }
}

#[derive(Debug, Default)]
struct Store {
    tables: HashMap<String, Rows>,
    being_deleted: HashSet<String>,
    version: u64,
}

impl Store {
    fn rows(&mut self, table: &str) -> Result<&mut Rows, BackendError> {
        if self.being_deleted.contains(table) {
            return Err(store_error(
                409,
                "TableBeingDeleted",
                "The specified table is being deleted.",
            ));
        }
        self.tables.get_mut(table).ok_or_else(|| {
            store_error(404, "TableNotFound", "The table specified does not exist.")
        })
    }

    fn stamp(&mut self, properties: Record) -> StoredEntity {
        self.version += 1;
        StoredEntity {
            properties,
            etag: format!("W/\"{}\"", self.version),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Shared in-memory store; every handle built from one backend sees the same data.
#[derive(Clone)]
pub struct InMemoryBackend {
    store: Arc<Mutex<Store>>,
    page_size: usize,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Backend whose listings default to `page_size` entities per page.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::default())),
            page_size: page_size.max(1),
        }
    }

    /// Mark a table as mid-deletion; entity writes then fail with `TableBeingDeleted`.
    pub async fn begin_table_deletion(&self, table: &str) {
        let mut store = self.store.lock().await;
        store.tables.remove(table);
        store.being_deleted.insert(table.to_string());
    }

    pub async fn entity_count(&self, table: &str) -> usize {
        let store = self.store.lock().await;
        store.tables.get(table).map_or(0, BTreeMap::len)
    }
}

impl BackendFactory for InMemoryBackend {
    fn service_client(
        &self,
        connection: &ConnectionConfig,
        options: ClientOptions,
    ) -> Result<Arc<dyn TableServiceClient>, ConfigError> {
        connection.check_transport(options)?;
        Ok(Arc::new(InMemoryServiceClient {
            store: Arc::clone(&self.store),
        }))
    }

    fn table_client(
        &self,
        connection: &ConnectionConfig,
        table_name: &str,
        options: ClientOptions,
    ) -> Result<Arc<dyn TableClient>, ConfigError> {
        connection.check_transport(options)?;
        Ok(Arc::new(InMemoryTableClient {
            store: Arc::clone(&self.store),
            table: table_name.to_string(),
            page_size: self.page_size,
        }))
    }
}

pub struct InMemoryServiceClient {
    store: Arc<Mutex<Store>>,
}

#[async_trait]
impl TableServiceClient for InMemoryServiceClient {
    async fn create_table(&self, name: &str) -> Result<(), BackendError> {
        if !TABLE_NAME_RE.is_match(name) {
            return Err(store_error(
                400,
                "InvalidResourceName",
                "The specified resource name contains invalid characters.",
            ));
        }
        let mut store = self.store.lock().await;
        if store.being_deleted.contains(name) {
            return Err(store_error(
                409,
                "TableBeingDeleted",
                "The specified table is being deleted.",
            ));
        }
        if store.tables.contains_key(name) {
            return Err(store_error(
                409,
                "TableAlreadyExists",
                "The table specified already exists.",
            ));
        }
        store.tables.insert(name.to_string(), Rows::new());
        Ok(())
    }

    async fn delete_table(&self, name: &str) -> Result<(), BackendError> {
        let mut store = self.store.lock().await;
        match store.tables.remove(name) {
            Some(_) => Ok(()),
            None => Err(store_error(
                404,
                "ResourceNotFound",
                "The specified resource does not exist.",
            )),
        }
    }
}

pub struct InMemoryTableClient {
    store: Arc<Mutex<Store>>,
    table: String,
    page_size: usize,
}

impl InMemoryTableClient {
    /// One page of matches strictly after `after`, plus the continuation key.
    async fn page(
        &self,
        after: Option<CompositeKey>,
        filter: &[(String, Value)],
        page_size: usize,
    ) -> Result<(Vec<Record>, Option<CompositeKey>), BackendError> {
        let mut store = self.store.lock().await;
        let rows = store.rows(&self.table)?;
        let lower = match &after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };

        let mut page = Vec::with_capacity(page_size);
        let mut last = None;
        for (key, entity) in rows.range::<CompositeKey, _>((lower, Bound::Unbounded)) {
            if page.len() == page_size {
                return Ok((page, last));
            }
            let wire = entity.to_wire(key);
            last = Some(key.clone());
            if matches_filter(&wire, filter) {
                page.push(wire);
            }
        }
        Ok((page, None))
    }
}

#[async_trait]
impl TableClient for InMemoryTableClient {
    fn table_name(&self) -> &str {
        &self.table
    }

    async fn get_entity(&self, partition_key: &str, row_key: &str) -> Result<Record, BackendError> {
        let key = entity_key(partition_key, row_key)?;
        let mut store = self.store.lock().await;
        let rows = store.rows(&self.table)?;
        rows.get(&key)
            .map(|entity| entity.to_wire(&key))
            .ok_or_else(not_found)
    }

    fn list_entities(&self, options: ListOptions) -> BoxStream<'_, Result<Record, BackendError>> {
        let filter = match options.filter.as_deref().map(parse_filter).transpose() {
            Ok(filter) => filter.unwrap_or_default(),
            Err(err) => return stream::once(async move { Err(err) }).boxed(),
        };
        let page_size = options
            .page_size
            .map_or(self.page_size, |size| (size as usize).max(1));

        // `Some(None)` = first page, `None` = exhausted
        stream::try_unfold(Some(None), move |cursor: Option<Option<CompositeKey>>| {
            let filter = filter.clone();
            async move {
                let Some(after) = cursor else {
                    return Ok(None);
                };
                let (page, next) = self.page(after, &filter, page_size).await?;
                let page = stream::iter(page.into_iter().map(Ok::<Record, BackendError>));
                Ok::<_, BackendError>(Some((page, next.map(Some))))
            }
        })
        .try_flatten()
        .boxed()
    }

    async fn create_entity(&self, entity: Record) -> Result<Record, BackendError> {
        let key = record_key(&entity)?;
        let mut store = self.store.lock().await;
        if store.rows(&self.table)?.contains_key(&key) {
            return Err(store_error(
                409,
                "EntityAlreadyExists",
                "The specified entity already exists.",
            ));
        }
        // Rejected writes never consume a version
        let stored = store.stamp(properties_of(entity));
        let wire = stored.to_wire(&key);
        store.rows(&self.table)?.insert(key, stored);
        Ok(wire)
    }

    async fn update_entity(&self, entity: Record, mode: UpdateMode) -> Result<Record, BackendError> {
        let key = record_key(&entity)?;
        let mut store = self.store.lock().await;
        let existing = store
            .rows(&self.table)?
            .get(&key)
            .map(|stored| stored.properties.clone())
            .ok_or_else(not_found)?;

        let properties = match mode {
            UpdateMode::Replace => properties_of(entity),
            UpdateMode::Merge => {
                let mut merged = existing;
                merged.extend(properties_of(entity));
                merged
            }
        };
        let stored = store.stamp(properties);
        let wire = stored.to_wire(&key);
        store.rows(&self.table)?.insert(key, stored);
        Ok(wire)
    }

    async fn delete_entity(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<DeleteResult, BackendError> {
        let key = entity_key(partition_key, row_key)?;
        let mut store = self.store.lock().await;
        store.rows(&self.table)?.remove(&key).ok_or_else(not_found)?;
        Ok(DeleteResult {
            status_code: 204,
            etag: None,
            request_id: Some(Uuid::new_v4().to_string()),
            date: Some(Utc::now().to_rfc2822()),
        })
    }
}

/// Error body shaped like the remote store's JSON error response.
fn store_error(status: u16, code: &str, message: &str) -> BackendError {
    let value = format!(
        "{message}\nRequestId:{}\nTime:{}",
        Uuid::new_v4(),
        Utc::now().to_rfc3339()
    );
    let body = json!({
        "odata.error": {
            "code": code,
            "message": { "lang": "en-US", "value": value }
        }
    });
    BackendError::new(body.to_string(), Some(status))
}

fn not_found() -> BackendError {
    store_error(
        404,
        "ResourceNotFound",
        "The specified resource does not exist.",
    )
}

fn invalid_input(message: &str) -> BackendError {
    store_error(400, "InvalidInput", message)
}

fn entity_key(partition_key: &str, row_key: &str) -> Result<CompositeKey, BackendError> {
    CompositeKey::new(partition_key, row_key)
        .map_err(|_| invalid_input("One of the request inputs is not valid."))
}

fn record_key(record: &Record) -> Result<CompositeKey, BackendError> {
    CompositeKey::from_record(record).map_err(|_| {
        store_error(
            400,
            "PropertiesNeedValue",
            "The values are not specified for all properties in the entity.",
        )
    })
}

fn properties_of(mut record: Record) -> Record {
    record.remove(WIRE_PARTITION_KEY);
    record.remove(WIRE_ROW_KEY);
    record.retain(|name, _| !name.starts_with("odata.") && name != "Timestamp");
    record
}

fn parse_filter(filter: &str) -> Result<Vec<(String, Value)>, BackendError> {
    if filter.trim().is_empty() {
        return Ok(Vec::new());
    }
    AND_RE
        .split(filter)
        .map(|clause| -> Result<(String, Value), BackendError> {
            let caps = CLAUSE_RE.captures(clause).ok_or_else(|| {
                invalid_input(&format!(
                    "One of the request inputs is not valid.\nUnsupported filter clause '{}'",
                    clause.trim()
                ))
            })?;
            let literal = match (caps.get(2), caps.get(3)) {
                (Some(quoted), _) => Value::String(quoted.as_str().replace("''", "'")),
                (None, Some(bare)) => parse_literal(bare.as_str()).ok_or_else(|| {
                    invalid_input(&format!(
                        "One of the request inputs is not valid.\nUnsupported literal '{}'",
                        bare.as_str()
                    ))
                })?,
                (None, None) => unreachable!("clause regex requires a literal"),
            };
            Ok((caps[1].to_string(), literal))
        })
        .collect()
}

fn parse_literal(raw: &str) -> Option<Value> {
    match raw {
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        _ => raw
            .trim_end_matches('L')
            .parse::<f64>()
            .ok()
            .map(|number| json!(number)),
    }
}

fn matches_filter(record: &Record, filter: &[(String, Value)]) -> bool {
    filter.iter().all(|(name, expected)| {
        match (record.get(name), expected) {
            (Some(Value::Number(actual)), Value::Number(expected)) => {
                actual.as_f64() == expected.as_f64()
            }
            (Some(actual), expected) => actual == expected,
            (None, _) => false,
        }
    })
}
