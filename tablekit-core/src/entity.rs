//! Entity mapping between caller types and the store's flat wire records.
//!
//! # Shapes
//!
//! - Entity side: `partitionKey` / `rowKey`, plus `etag` / `timestamp` when a
//!   type opts into them through [`TableEntity::METADATA_FIELDS`].
//! - Wire side: `PartitionKey` / `RowKey`, `Timestamp`, `odata.*` properties
//!   and `<field>@odata.type` annotations.
//!
//! Mapping is pure. A wire record that is empty once metadata is stripped maps
//! to `None`: an entity made only of metadata reads the same as a missing one.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Flat key-value record as the backend stores it.
pub type Record = Map<String, Value>;

pub const PARTITION_KEY: &str = "partitionKey";
pub const ROW_KEY: &str = "rowKey";
pub const WIRE_PARTITION_KEY: &str = "PartitionKey";
pub const WIRE_ROW_KEY: &str = "RowKey";

const ETAG: &str = "etag";
const TIMESTAMP: &str = "timestamp";
const WIRE_ETAG: &str = "odata.etag";
const WIRE_TIMESTAMP: &str = "Timestamp";

/// Entity mapping errors
#[derive(Error, Debug)]
pub enum MappingError {
    #[error("{field} must not be empty")]
    EmptyKey { field: &'static str },

    #[error("entity is missing its {field}")]
    MissingKey { field: &'static str },

    #[error("{field} must be a string")]
    InvalidKey { field: &'static str },

    #[error("property {field} appears twice once key and metadata names are mapped")]
    DuplicateField { field: String },

    #[error("entity must serialize to a JSON object")]
    NotAnObject,

    #[error("failed to serialize entity: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to deserialize entity: {0}")]
    Deserialize(#[source] serde_json::Error),

    #[error("backend returned no entity fields")]
    EmptyResult,
}

/// Caller-defined record type stored in a table.
///
/// Implement it with an empty `impl` block on any serde-derived struct whose
/// key fields serialize as `partitionKey` / `rowKey`:
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use tablekit_core::TableEntity;
///
/// #[derive(Debug, Serialize, Deserialize)]
/// #[serde(rename_all = "camelCase")]
/// struct Order {
///     partition_key: String,
///     row_key: String,
///     total: f64,
/// }
///
/// impl TableEntity for Order {}
/// ```
pub trait TableEntity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Backend metadata fields (`etag`, `timestamp`) this type declares and keeps.
    const METADATA_FIELDS: &'static [&'static str] = &[];
}

/// Schema-less entity, used where the shape is only known at runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DynamicEntity(pub Record);

impl TableEntity for DynamicEntity {
    const METADATA_FIELDS: &'static [&'static str] = &[ETAG, TIMESTAMP];
}

/// Partition key + row key; identifies one entity in one table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompositeKey {
    partition_key: String,
    row_key: String,
}

impl CompositeKey {
    pub fn new(
        partition_key: impl Into<String>,
        row_key: impl Into<String>,
    ) -> Result<Self, MappingError> {
        let partition_key = partition_key.into();
        let row_key = row_key.into();
        if partition_key.is_empty() {
            return Err(MappingError::EmptyKey {
                field: PARTITION_KEY,
            });
        }
        if row_key.is_empty() {
            return Err(MappingError::EmptyKey { field: ROW_KEY });
        }
        Ok(Self {
            partition_key,
            row_key,
        })
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn row_key(&self) -> &str {
        &self.row_key
    }

    /// Read the key back out of a wire record.
    pub fn from_record(record: &Record) -> Result<Self, MappingError> {
        let partition_key = key_field(record, WIRE_PARTITION_KEY, PARTITION_KEY)?;
        let row_key = key_field(record, WIRE_ROW_KEY, ROW_KEY)?;
        Self::new(partition_key, row_key)
    }
}

fn key_field<'a>(
    record: &'a Record,
    wire_name: &str,
    field: &'static str,
) -> Result<&'a str, MappingError> {
    record
        .get(wire_name)
        .and_then(Value::as_str)
        .ok_or(MappingError::MissingKey { field })
}

/// Partial update for an existing entity.
///
/// Key fields are explicit slots: an empty slot is filled from the key the
/// update is addressed to; a filled slot wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityPatch {
    pub partition_key: Option<String>,
    pub row_key: Option<String>,
    pub fields: Record,
}

impl EntityPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one property; key fields go to their slots.
    ///
    /// A key field must be a non-empty string.
    pub fn set(
        mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<Self, MappingError> {
        let name = name.into();
        let slot = match name.as_str() {
            PARTITION_KEY | WIRE_PARTITION_KEY => Some((&mut self.partition_key, PARTITION_KEY)),
            ROW_KEY | WIRE_ROW_KEY => Some((&mut self.row_key, ROW_KEY)),
            _ => None,
        };
        match (slot, value.into()) {
            (Some((_, field)), Value::String(key)) if key.is_empty() => {
                return Err(MappingError::EmptyKey { field })
            }
            (Some((slot, _)), Value::String(key)) => *slot = Some(key),
            (Some((_, field)), _) => return Err(MappingError::InvalidKey { field }),
            (None, value) => {
                self.fields.insert(name, value);
            }
        }
        Ok(self)
    }

    /// Build a patch from any value that serializes to a JSON object.
    pub fn from_serialize<P: Serialize + ?Sized>(patch: &P) -> Result<Self, MappingError> {
        let Value::Object(record) = serde_json::to_value(patch).map_err(MappingError::Serialize)?
        else {
            return Err(MappingError::NotAnObject);
        };
        record
            .into_iter()
            .try_fold(Self::new(), |patch, (name, value)| patch.set(name, value))
    }

    /// Patch carrying every field of a full entity, minus its declared metadata.
    pub fn from_entity<T: TableEntity>(entity: &T) -> Result<Self, MappingError> {
        Ok(Self::from_serialize(entity)?.without_metadata::<T>())
    }

    /// Drop the metadata fields `T` declares; the store owns those.
    pub fn without_metadata<T: TableEntity>(mut self) -> Self {
        self.fields
            .retain(|name, _| !T::METADATA_FIELDS.contains(&name.as_str()));
        self
    }

    /// Wire record for an update addressed to `key`.
    pub fn into_record(self, key: &CompositeKey) -> Record {
        let mut record = strip_for_write(self.fields);
        record.insert(
            WIRE_PARTITION_KEY.to_string(),
            Value::String(
                self.partition_key
                    .unwrap_or_else(|| key.partition_key().to_string()),
            ),
        );
        record.insert(
            WIRE_ROW_KEY.to_string(),
            Value::String(self.row_key.unwrap_or_else(|| key.row_key().to_string())),
        );
        record
    }
}

/// Serialize an entity into the store's write representation.
///
/// The entity must carry its key. Backend metadata and the metadata fields
/// `T` declares are never written; any other field is.
pub fn to_record<T: TableEntity>(entity: &T) -> Result<Record, MappingError> {
    let Value::Object(fields) = serde_json::to_value(entity).map_err(MappingError::Serialize)?
    else {
        return Err(MappingError::NotAnObject);
    };

    let mut record = Record::new();
    for (name, value) in strip_for_write(fields) {
        if T::METADATA_FIELDS.contains(&name.as_str()) {
            continue;
        }
        let name = match name.as_str() {
            PARTITION_KEY => WIRE_PARTITION_KEY.to_string(),
            ROW_KEY => WIRE_ROW_KEY.to_string(),
            _ => name,
        };
        insert_unique(&mut record, name, value)?;
    }
    CompositeKey::from_record(&record)?;
    Ok(record)
}

/// Map a raw backend record to `T`.
///
/// Returns `Ok(None)` when nothing but metadata was present. Store metadata
/// reaches `T` only through the fields it declares; a stored property whose
/// mapped name collides with another is a [`MappingError::DuplicateField`].
pub fn from_record<T: TableEntity>(raw: Record) -> Result<Option<T>, MappingError> {
    let mut record = Record::new();
    for (name, value) in raw {
        let name = match name.as_str() {
            WIRE_PARTITION_KEY => PARTITION_KEY.to_string(),
            WIRE_ROW_KEY => ROW_KEY.to_string(),
            WIRE_ETAG | WIRE_TIMESTAMP => {
                let field = if name == WIRE_ETAG { ETAG } else { TIMESTAMP };
                if !T::METADATA_FIELDS.contains(&field) {
                    continue;
                }
                field.to_string()
            }
            _ if is_wire_metadata(&name) => continue,
            _ => name,
        };
        insert_unique(&mut record, name, value)?;
    }

    if record.is_empty() {
        return Ok(None);
    }

    serde_json::from_value(Value::Object(record))
        .map(Some)
        .map_err(MappingError::Deserialize)
}

fn is_wire_metadata(name: &str) -> bool {
    name.starts_with("odata.") || name.contains("@odata.")
}

fn strip_for_write(mut record: Record) -> Record {
    record.retain(|name, _| !is_wire_metadata(name) && name != WIRE_TIMESTAMP);
    record
}

fn insert_unique(record: &mut Record, name: String, value: Value) -> Result<(), MappingError> {
    if record.contains_key(&name) {
        return Err(MappingError::DuplicateField { field: name });
    }
    record.insert(name, value);
    Ok(())
}
