//! Table service REST handles over reqwest.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::header::HeaderMap;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, trace, warn};
use url::Url;

use tablekit_core::{
    BackendError, DeleteResult, ListOptions, Record, TableClient, TableServiceClient, UpdateMode,
};

use crate::auth::{http_date, Signer};

const API_VERSION: &str = "2019-02-02";
const ACCEPT_MINIMAL_METADATA: &str = "application/json;odata=minimalmetadata";
const CONTINUATION_PARTITION_KEY: &str = "x-ms-continuation-nextpartitionkey";
const CONTINUATION_ROW_KEY: &str = "x-ms-continuation-nextrowkey";

/// Shared request plumbing for one storage account.
#[derive(Debug)]
pub(crate) struct Endpoint {
    pub(crate) http: reqwest::Client,
    pub(crate) base: Url,
    pub(crate) signer: Signer,
}

impl Endpoint {
    /// `base` joined with one path segment; the segment is expected pre-escaped.
    fn url(&self, segment: &str) -> Url {
        let mut url = self.base.clone();
        let path = format!("{}/{segment}", self.base.path().trim_end_matches('/'));
        url.set_path(&path);
        url
    }

    fn request(&self, method: Method, mut url: Url) -> RequestBuilder {
        self.signer.authorize_url(&mut url);
        let date = http_date(Utc::now());
        let authorization = self.signer.authorization(&date, &url);

        trace!(%method, %url, "table request");
        let builder = self
            .http
            .request(method, url)
            .header("x-ms-date", date)
            .header("x-ms-version", API_VERSION)
            .header("Accept", ACCEPT_MINIMAL_METADATA)
            .header("DataServiceVersion", "3.0;NetFx")
            .header("MaxDataServiceVersion", "3.0;NetFx");
        match authorization {
            Some(value) => builder.header("Authorization", value),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, BackendError> {
        let response = builder.send().await.map_err(BackendError::transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        // Store errors arrive as a JSON body; keep it verbatim for classification
        let body = response.text().await.unwrap_or_default();
        if is_throttled(status) {
            warn!(status = status.as_u16(), "table service is throttling requests");
        } else {
            debug!(status = status.as_u16(), "table request rejected");
        }
        let message = if body.trim().is_empty() {
            status.to_string()
        } else {
            body
        };
        Err(BackendError::new(message, Some(status.as_u16())))
    }

    async fn json_body(response: Response) -> Result<Record, BackendError> {
        response.json::<Record>().await.map_err(BackendError::transport)
    }
}

/// Quote a value for an OData key predicate: `'` doubles, then percent-encoding.
pub(crate) fn key_literal(value: &str) -> String {
    format!("'{}'", urlencoding::encode(&value.replace('\'', "''")))
}

fn entity_segment(table: &str, partition_key: &str, row_key: &str) -> String {
    format!(
        "{table}(PartitionKey={},RowKey={})",
        key_literal(partition_key),
        key_literal(row_key)
    )
}

fn key_of(record: &Record) -> Result<(String, String), BackendError> {
    let key = tablekit_core::CompositeKey::from_record(record).map_err(BackendError::transport)?;
    Ok((key.partition_key().to_string(), key.row_key().to_string()))
}

fn is_throttled(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[derive(Debug)]
pub struct HttpServiceClient {
    endpoint: Arc<Endpoint>,
}

impl HttpServiceClient {
    pub(crate) fn new(endpoint: Arc<Endpoint>) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl TableServiceClient for HttpServiceClient {
    async fn create_table(&self, name: &str) -> Result<(), BackendError> {
        let url = self.endpoint.url("Tables");
        let request = self
            .endpoint
            .request(Method::POST, url)
            .header("Prefer", "return-no-content")
            .json(&json!({ "TableName": name }));
        self.endpoint.send(request).await?;
        debug!(table = name, "table created");
        Ok(())
    }

    async fn delete_table(&self, name: &str) -> Result<(), BackendError> {
        let url = self
            .endpoint
            .url(&format!("Tables({})", key_literal(name)));
        let request = self.endpoint.request(Method::DELETE, url);
        self.endpoint.send(request).await?;
        debug!(table = name, "table deleted");
        Ok(())
    }
}

/// One page of a query response.
#[derive(Debug, Deserialize)]
struct QueryPage {
    #[serde(default)]
    value: Vec<Record>,
}

/// Continuation token from the response headers; `None` on the last page.
type Continuation = Option<(String, Option<String>)>;

#[derive(Debug)]
pub struct HttpTableClient {
    endpoint: Arc<Endpoint>,
    table: String,
}

impl HttpTableClient {
    pub(crate) fn new(endpoint: Arc<Endpoint>, table: impl Into<String>) -> Self {
        Self {
            endpoint,
            table: table.into(),
        }
    }

    fn query_url(
        &self,
        options: &ListOptions,
        continuation: Option<&(String, Option<String>)>,
    ) -> Url {
        let mut url = self.endpoint.url(&format!("{}()", self.table));
        {
            let mut query = url.query_pairs_mut();
            if let Some(filter) = &options.filter {
                query.append_pair("$filter", filter);
            }
            if let Some(top) = options.page_size {
                query.append_pair("$top", &top.to_string());
            }
            if let Some((partition_key, row_key)) = continuation {
                query.append_pair("NextPartitionKey", partition_key);
                if let Some(row_key) = row_key {
                    query.append_pair("NextRowKey", row_key);
                }
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        url
    }

    async fn page(
        &self,
        options: &ListOptions,
        continuation: Option<&(String, Option<String>)>,
    ) -> Result<(Vec<Record>, Continuation), BackendError> {
        let url = self.query_url(options, continuation);
        let response = self
            .endpoint
            .send(self.endpoint.request(Method::GET, url))
            .await?;

        let headers = response.headers();
        let next = header_string(headers, CONTINUATION_PARTITION_KEY)
            .map(|partition_key| (partition_key, header_string(headers, CONTINUATION_ROW_KEY)));
        let page: QueryPage = response.json().await.map_err(BackendError::transport)?;
        trace!(count = page.value.len(), more = next.is_some(), "query page");
        Ok((page.value, next))
    }

    fn entity_url(&self, partition_key: &str, row_key: &str) -> Url {
        self.endpoint
            .url(&entity_segment(&self.table, partition_key, row_key))
    }
}

#[async_trait]
impl TableClient for HttpTableClient {
    fn table_name(&self) -> &str {
        &self.table
    }

    async fn get_entity(&self, partition_key: &str, row_key: &str) -> Result<Record, BackendError> {
        let url = self.entity_url(partition_key, row_key);
        let response = self
            .endpoint
            .send(self.endpoint.request(Method::GET, url))
            .await?;
        Endpoint::json_body(response).await
    }

    fn list_entities(&self, options: ListOptions) -> BoxStream<'_, Result<Record, BackendError>> {
        // `Some(None)` = first page, `None` = no more pages
        stream::try_unfold(Some(None), move |cursor: Option<Continuation>| {
            let options = options.clone();
            async move {
                let Some(continuation) = cursor else {
                    return Ok(None);
                };
                let (records, next) = self.page(&options, continuation.as_ref()).await?;
                let records = stream::iter(records.into_iter().map(Ok::<Record, BackendError>));
                Ok::<_, BackendError>(Some((records, next.map(Some))))
            }
        })
        .try_flatten()
        .boxed()
    }

    async fn create_entity(&self, entity: Record) -> Result<Record, BackendError> {
        let url = self.endpoint.url(&self.table);
        let request = self
            .endpoint
            .request(Method::POST, url)
            .header("Prefer", "return-content")
            .json(&Value::Object(entity));
        let response = self.endpoint.send(request).await?;
        Endpoint::json_body(response).await
    }

    async fn update_entity(&self, entity: Record, mode: UpdateMode) -> Result<Record, BackendError> {
        let (partition_key, row_key) = key_of(&entity)?;
        let method = match mode {
            UpdateMode::Merge => Method::PATCH,
            UpdateMode::Replace => Method::PUT,
        };
        let request = self
            .endpoint
            .request(method, self.entity_url(&partition_key, &row_key))
            .header("If-Match", "*")
            .json(&Value::Object(entity));
        self.endpoint.send(request).await?;

        // Updates answer 204 with no body; read the stored entity back
        self.get_entity(&partition_key, &row_key).await
    }

    async fn delete_entity(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<DeleteResult, BackendError> {
        let request = self
            .endpoint
            .request(Method::DELETE, self.entity_url(partition_key, row_key))
            .header("If-Match", "*");
        let response = self.endpoint.send(request).await?;

        let headers = response.headers();
        Ok(DeleteResult {
            status_code: response.status().as_u16(),
            etag: header_string(headers, "etag"),
            request_id: header_string(headers, "x-ms-request-id"),
            date: header_string(headers, "date"),
        })
    }
}
