use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tablekit_core::{
    ConnectionConfig, ConnectionManager, DynamicEntity, EntityPatch, ErrorCode, InMemoryBackend,
    RepoError, RepositoryOptions, TableEntity, TableRepository,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Order {
    partition_key: String,
    row_key: String,
    customer: String,
    total: f64,
}

impl TableEntity for Order {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuditedOrder {
    partition_key: String,
    row_key: String,
    total: f64,
    etag: String,
    timestamp: String,
}

impl TableEntity for AuditedOrder {
    const METADATA_FIELDS: &'static [&'static str] = &["etag", "timestamp"];
}

/// `timestamp` here is the caller's own data, not store metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Reading {
    partition_key: String,
    row_key: String,
    timestamp: String,
    celsius: f64,
}

impl TableEntity for Reading {}

fn order(pk: &str, rk: &str, total: f64) -> Order {
    Order {
        partition_key: pk.to_string(),
        row_key: rk.to_string(),
        customer: "ada".to_string(),
        total,
    }
}

fn repo<T: TableEntity>(backend: &InMemoryBackend, table: &str) -> TableRepository<T> {
    let connections = ConnectionManager::new(
        Arc::new(backend.clone()),
        ConnectionConfig::development_storage(),
        table,
        false,
    );
    TableRepository::new(Arc::new(connections), RepositoryOptions::default())
}

async fn provisioned(table: &str) -> (InMemoryBackend, TableRepository<Order>) {
    let backend = InMemoryBackend::new();
    let repo = repo::<Order>(&backend, table);
    assert!(repo.create_table_if_not_exists(None).await.unwrap());
    (backend, repo)
}

#[tokio::test]
async fn test_crud_round_trip() {
    let (backend, repo) = provisioned("orders").await;

    let created = repo.create(&order("eu", "1", 10.0)).await.unwrap();
    assert_eq!(created, Some(order("eu", "1", 10.0)));

    let found = repo.find("eu", "1").await.unwrap();
    assert_eq!(found, Some(order("eu", "1", 10.0)));

    let updated = repo
        .update("eu", "1", EntityPatch::new().set("total", 12.5).unwrap())
        .await
        .unwrap();
    assert_eq!(updated.total, 12.5);
    assert_eq!(updated.customer, "ada");

    let deleted = repo.delete("eu", "1").await.unwrap();
    assert_eq!(deleted.status_code, 204);
    assert!(deleted.request_id.is_some());
    assert_eq!(backend.entity_count("orders").await, 0);

    assert_eq!(repo.find("eu", "1").await.unwrap(), None);
}

#[tokio::test]
async fn test_find_missing_entity_is_none() {
    let (_backend, repo) = provisioned("orders").await;
    assert_eq!(repo.find("eu", "404").await.unwrap(), None);
}

#[tokio::test]
async fn test_find_all_with_filter() {
    let (_backend, repo) = provisioned("orders").await;
    for (pk, rk) in [("eu", "1"), ("us", "2"), ("eu", "3")] {
        repo.create(&order(pk, rk, 1.0)).await.unwrap();
    }

    let all = repo.find_all(None).await.unwrap();
    assert_eq!(all.len(), 3);

    let eu = repo.find_all(Some("PartitionKey eq 'eu'")).await.unwrap();
    let rows: Vec<_> = eu.iter().map(|o| o.row_key.as_str()).collect();
    assert_eq!(rows, ["1", "3"]);
}

#[tokio::test]
async fn test_find_all_with_malformed_filter_is_invalid_input() {
    let (_backend, repo) = provisioned("orders").await;
    repo.create(&order("eu", "1", 1.0)).await.unwrap();

    let err = repo.find_all(Some("total gt")).await.unwrap_err();
    let domain = err.domain().expect("domain error");
    assert_eq!(domain.kind(), ErrorCode::InvalidInput);
    assert_eq!(domain.status_code, 400);
    assert!(!domain.message.contains('\n'));
    assert!(domain.message.starts_with("One of the request inputs is not valid. "));
    assert!(domain.message.contains("RequestId:"));
}

#[tokio::test]
async fn test_update_fills_missing_keys_from_call() {
    let (_backend, repo) = provisioned("orders").await;
    repo.create(&order("eu", "1", 1.0)).await.unwrap();

    let patch = EntityPatch::from_serialize(&json!({ "customer": "grace" })).unwrap();
    let updated = repo.update("eu", "1", patch).await.unwrap();
    assert_eq!(updated.partition_key, "eu");
    assert_eq!(updated.row_key, "1");
    assert_eq!(updated.customer, "grace");
}

#[tokio::test]
async fn test_update_missing_entity_is_not_found() {
    let (_backend, repo) = provisioned("orders").await;
    let err = repo
        .update("eu", "9", EntityPatch::new().set("total", 1.0).unwrap())
        .await
        .unwrap_err();
    let domain = err.domain().expect("domain error");
    assert!(domain.is_not_found());
    assert_eq!(domain.message, "Error processing entity. Entity not found.");
}

#[tokio::test]
async fn test_second_table_create_reports_already_exists() {
    let (_backend, repo) = provisioned("orders").await;
    let err = repo.create_table_if_not_exists(None).await.unwrap_err();
    let domain = err.domain().expect("domain error");
    assert!(domain.is_table_already_exists());
    assert_eq!(domain.status_code, 409);
    assert_eq!(
        domain.message,
        "Error creating table. Table orders already exists."
    );
}

#[tokio::test]
async fn test_create_table_by_explicit_name() {
    let (_backend, repo) = provisioned("orders").await;
    assert!(repo.create_table_if_not_exists(Some("invoices")).await.unwrap());

    let err = repo
        .create_table_if_not_exists(Some("invoices"))
        .await
        .unwrap_err();
    assert_eq!(
        err.domain().map(|d| d.message.as_str()),
        Some("Error creating table. Table invoices already exists.")
    );
}

#[tokio::test]
async fn test_duplicate_entity_is_entity_already_exists() {
    let (_backend, repo) = provisioned("orders").await;
    repo.create(&order("eu", "1", 1.0)).await.unwrap();
    let err = repo.create(&order("eu", "1", 2.0)).await.unwrap_err();
    let domain = err.domain().expect("domain error");
    assert_eq!(domain.kind(), ErrorCode::EntityAlreadyExists);
    assert_eq!(domain.status_code, 409);
}

#[tokio::test]
async fn test_table_being_deleted() {
    let (backend, repo) = provisioned("orders").await;
    backend.begin_table_deletion("orders").await;

    let err = repo.create(&order("eu", "1", 1.0)).await.unwrap_err();
    let domain = err.domain().expect("domain error");
    assert_eq!(domain.kind(), ErrorCode::TableBeingDeleted);
    assert_eq!(
        domain.message,
        "Error creating entity. Table orders is being deleted. Try again later."
    );
}

#[tokio::test]
async fn test_declared_metadata_survives_reads() {
    let backend = InMemoryBackend::new();
    let plain = repo::<Order>(&backend, "orders");
    plain.create_table_if_not_exists(None).await.unwrap();
    plain.create(&order("eu", "1", 3.0)).await.unwrap();

    let audited = repo::<AuditedOrder>(&backend, "orders");
    let found = audited.find("eu", "1").await.unwrap().expect("entity");
    assert!(found.etag.starts_with("W/"));
    assert!(!found.timestamp.is_empty());
}

#[tokio::test]
async fn test_plain_timestamp_field_is_stored_and_read_back() {
    let backend = InMemoryBackend::new();
    let repo = repo::<Reading>(&backend, "readings");
    repo.create_table_if_not_exists(None).await.unwrap();

    let reading = Reading {
        partition_key: "sensor-1".to_string(),
        row_key: "0001".to_string(),
        timestamp: "2024-05-01T08:00:00Z".to_string(),
        celsius: 21.5,
    };
    let created = repo.create(&reading).await.unwrap().expect("entity");
    assert_eq!(created, reading);

    let found = repo.find("sensor-1", "0001").await.unwrap().expect("entity");
    assert_eq!(found.timestamp, "2024-05-01T08:00:00Z");
}

#[tokio::test]
async fn test_patch_with_non_string_key_never_reaches_store() {
    let (_backend, repo) = provisioned("orders").await;
    repo.create(&order("eu", "1", 3.0)).await.unwrap();

    let err = EntityPatch::from_serialize(&json!({ "rowKey": 7, "total": 2.0 })).unwrap_err();
    assert_eq!(err.to_string(), "rowKey must be a string");

    let found = repo.find("eu", "1").await.unwrap().expect("entity");
    assert_eq!(found, order("eu", "1", 3.0));
    let all = repo.find_all(None).await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_update_ignores_declared_metadata_in_patch() {
    let backend = InMemoryBackend::new();
    let repo = repo::<DynamicEntity>(&backend, "events");
    repo.create_table_if_not_exists(None).await.unwrap();

    let serde_json::Value::Object(fields) =
        json!({ "partitionKey": "2024", "rowKey": "a", "kind": "login" })
    else {
        unreachable!()
    };
    let created = repo
        .create(&DynamicEntity(fields))
        .await
        .unwrap()
        .expect("entity");

    // Read-modify-write of a fetched entity carries etag/timestamp along
    let mut edited = created.0.clone();
    edited.insert("kind".into(), json!("logout"));
    let patch = EntityPatch::from_serialize(&edited).unwrap();
    let updated = repo.update("2024", "a", patch).await.unwrap();
    assert_eq!(updated.0.get("kind"), Some(&json!("logout")));
    assert_ne!(updated.0.get("etag"), created.0.get("etag"));
}

#[tokio::test]
async fn test_dynamic_entities() {
    let backend = InMemoryBackend::new();
    let repo = repo::<DynamicEntity>(&backend, "events");
    repo.create_table_if_not_exists(None).await.unwrap();

    let serde_json::Value::Object(fields) =
        json!({ "partitionKey": "2024", "rowKey": "a", "kind": "login" })
    else {
        unreachable!()
    };
    let created = repo
        .create(&DynamicEntity(fields))
        .await
        .unwrap()
        .expect("entity");
    assert_eq!(created.0.get("kind"), Some(&json!("login")));
    assert_eq!(created.0.get("partitionKey"), Some(&json!("2024")));
    assert!(created.0.contains_key("etag"));
    assert!(!created.0.keys().any(|k| k.starts_with("odata.")));
}

#[tokio::test]
async fn test_repositories_share_one_manager() {
    let backend = InMemoryBackend::new();
    let orders = repo::<Order>(&backend, "orders");
    orders.create_table_if_not_exists(None).await.unwrap();

    let twin: TableRepository<Order> =
        TableRepository::new(Arc::clone(orders.connections()), orders.options());
    orders.create(&order("eu", "1", 1.0)).await.unwrap();
    assert!(twin.find("eu", "1").await.unwrap().is_some());

    let a = orders.connections().entity_handle().unwrap();
    let b = twin.connections().entity_handle().unwrap();
    assert!(Arc::ptr_eq(&a, &b));
}

#[tokio::test]
async fn test_insecure_remote_endpoint_is_config_error() {
    let connection = ConnectionConfig::parse(
        "DefaultEndpointsProtocol=http;AccountName=acme;AccountKey=a2V5;TableEndpoint=http://10.1.2.3:10002/acme",
    )
    .unwrap();
    let connections =
        ConnectionManager::new(Arc::new(InMemoryBackend::new()), connection, "orders", false);
    let repo: TableRepository<Order> =
        TableRepository::new(Arc::new(connections), RepositoryOptions::default());

    assert!(matches!(
        repo.find("eu", "1").await.unwrap_err(),
        RepoError::Config(_)
    ));
}
