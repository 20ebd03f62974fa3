//! Remote document store boundary.
//!
//! The sync engine is the only caller of this trait. Any store exposing
//! list/create/update over a collection of JSON documents is
//! substitutable: `HttpStore` talks to the hosted REST backend and
//! `MemoryStore` is an in-process implementation used in tests and for
//! embedding without a backend. Both honor the idempotency key handed to
//! `create`, which is what makes a crashed drain safe to replay.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

use crate::error::SyncError;

/// Default timeout for remote requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// The full authoritative record set for a collection.
    async fn list_all(&self, collection: &str) -> Result<Vec<Value>, SyncError>;

    /// Create a document; returns the store-assigned id. Two creates with
    /// the same idempotency key must yield the same document.
    async fn create(
        &self,
        collection: &str,
        payload: &Value,
        idempotency_key: &str,
    ) -> Result<String, SyncError>;

    /// Apply a partial payload to an existing document. Present fields
    /// overwrite; omitted fields are retained.
    async fn update(&self, collection: &str, id: &str, patch: &Value) -> Result<(), SyncError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// REST client for the hosted document store.
pub struct HttpStore {
    base_url: String,
    api_key: String,
    client: Client,
}

/// Normalise the store base URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Map a transport error onto the taxonomy: anything that means the store
/// never processed the request is transient.
fn transport_error(url: &str, err: &reqwest::Error) -> SyncError {
    if err.is_connect() {
        return SyncError::Transient(format!("cannot reach record store at {url}"));
    }
    if err.is_timeout() {
        return SyncError::Transient(format!("connection to {url} timed out"));
    }
    if err.is_builder() {
        return SyncError::Rejected(format!("invalid record store URL: {url}"));
    }
    SyncError::Transient(format!("network error communicating with {url}: {err}"))
}

/// Map an HTTP status onto the taxonomy. 5xx means the store is up but
/// not serving, so the entry stays queued; 4xx is a real rejection.
fn status_error(status: StatusCode, body: &str) -> SyncError {
    let detail = if body.trim().is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {}", status.as_u16(), body.trim())
    };
    if status.is_server_error() {
        SyncError::Transient(format!("record store error ({detail})"))
    } else {
        SyncError::Rejected(detail)
    }
}

impl HttpStore {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Rejected(format!("build HTTP client: {e}")))?;
        Ok(Self {
            base_url: normalize_base_url(base_url),
            api_key: api_key.trim().to_string(),
            client,
        })
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/api/collections/{collection}", self.base_url)
    }

    async fn read_body(resp: reqwest::Response) -> Result<Value, SyncError> {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(status_error(status, &text));
        }
        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| SyncError::Rejected(format!("invalid JSON from record store: {e}")))
    }
}

#[async_trait]
impl RemoteStore for HttpStore {
    async fn list_all(&self, collection: &str) -> Result<Vec<Value>, SyncError> {
        let url = self.collection_url(collection);
        let resp = self
            .client
            .get(&url)
            .header("X-POS-API-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;

        let body = Self::read_body(resp).await?;
        // Accept either a bare array or an enveloped `{"records": [...]}`.
        let records = match body {
            Value::Array(arr) => arr,
            Value::Object(mut obj) => match obj.remove("records") {
                Some(Value::Array(arr)) => arr,
                _ => {
                    return Err(SyncError::Rejected(
                        "unexpected list response shape".to_string(),
                    ))
                }
            },
            _ => Vec::new(),
        };
        Ok(records)
    }

    async fn create(
        &self,
        collection: &str,
        payload: &Value,
        idempotency_key: &str,
    ) -> Result<String, SyncError> {
        let url = self.collection_url(collection);
        let resp = self
            .client
            .post(&url)
            .header("X-POS-API-Key", &self.api_key)
            .header("X-Idempotency-Key", idempotency_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;

        let body = Self::read_body(resp).await?;
        let id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::Rejected("create response missing id".to_string()))?
            .to_string();
        info!(collection, id = %id, "remote create confirmed");
        Ok(id)
    }

    async fn update(&self, collection: &str, id: &str, patch: &Value) -> Result<(), SyncError> {
        let url = format!("{}/{id}", self.collection_url(collection));
        let resp = self
            .client
            .patch(&url)
            .header("X-POS-API-Key", &self.api_key)
            .json(patch)
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;

        Self::read_body(resp).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    collections: HashMap<String, BTreeMap<String, Value>>,
    // idempotency key -> assigned id, for create dedup across replays
    created: HashMap<String, String>,
    injected_failures: VecDeque<SyncError>,
    next_id: u64,
}

/// In-process document store. Creates are deduplicated by idempotency
/// key; `inject_failure` makes the next operation fail, for drain tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error to be returned by the next store operation.
    pub fn inject_failure(&self, err: SyncError) {
        self.inner
            .lock()
            .expect("memory store lock")
            .injected_failures
            .push_back(err);
    }

    /// Number of documents in a collection.
    pub fn record_count(&self, collection: &str) -> usize {
        self.inner
            .lock()
            .expect("memory store lock")
            .collections
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    /// Fetch a document by id (test introspection).
    pub fn record(&self, collection: &str, id: &str) -> Option<Value> {
        self.inner
            .lock()
            .expect("memory store lock")
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned()
    }

    fn take_failure(&self) -> Option<SyncError> {
        self.inner
            .lock()
            .expect("memory store lock")
            .injected_failures
            .pop_front()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn list_all(&self, collection: &str) -> Result<Vec<Value>, SyncError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let inner = self.inner.lock().expect("memory store lock");
        Ok(inner
            .collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn create(
        &self,
        collection: &str,
        payload: &Value,
        idempotency_key: &str,
    ) -> Result<String, SyncError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let mut inner = self.inner.lock().expect("memory store lock");

        if let Some(existing) = inner.created.get(idempotency_key) {
            return Ok(existing.clone());
        }

        inner.next_id += 1;
        let id = format!("rem-{:06}", inner.next_id);

        let mut doc = payload.clone();
        if let Value::Object(ref mut map) = doc {
            map.insert("id".to_string(), Value::String(id.clone()));
        }
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), doc);
        inner
            .created
            .insert(idempotency_key.to_string(), id.clone());
        Ok(id)
    }

    async fn update(&self, collection: &str, id: &str, patch: &Value) -> Result<(), SyncError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let mut inner = self.inner.lock().expect("memory store lock");
        let doc = inner
            .collections
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| SyncError::Rejected(format!("no such document: {collection}/{id}")))?;

        // Document-store update semantics: present top-level fields
        // overwrite, omitted fields are retained.
        if let (Value::Object(target), Value::Object(fields)) = (doc, patch) {
            for (k, v) in fields {
                target.insert(k.clone(), v.clone());
            }
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("store.example.com"),
            "https://store.example.com"
        );
        assert_eq!(
            normalize_base_url("https://store.example.com/api/"),
            "https://store.example.com"
        );
        assert_eq!(normalize_base_url("localhost:3000"), "http://localhost:3000");
        assert_eq!(
            normalize_base_url("  https://store.example.com// "),
            "https://store.example.com"
        );
    }

    #[test]
    fn test_status_error_classification() {
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, ""),
            SyncError::Transient(_)
        ));
        assert!(matches!(
            status_error(StatusCode::UNPROCESSABLE_ENTITY, "bad payload"),
            SyncError::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn test_memory_create_dedups_by_idempotency_key() {
        let store = MemoryStore::new();
        let payload = serde_json::json!({"price": 130.0});

        let first = store.create("payments", &payload, "create:offline-1").await.unwrap();
        let second = store.create("payments", &payload, "create:offline-1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.record_count("payments"), 1);
    }

    #[tokio::test]
    async fn test_memory_update_retains_omitted_fields() {
        let store = MemoryStore::new();
        let id = store
            .create(
                "payments",
                &serde_json::json!({"price": 100.0, "customerName": "Ana"}),
                "k1",
            )
            .await
            .unwrap();

        store
            .update("payments", &id, &serde_json::json!({"price": 130.0}))
            .await
            .unwrap();

        let doc = store.record("payments", &id).unwrap();
        assert_eq!(doc["price"], 130.0);
        assert_eq!(doc["customerName"], "Ana");
    }

    #[tokio::test]
    async fn test_memory_injected_failure_is_one_shot() {
        let store = MemoryStore::new();
        store.inject_failure(SyncError::Transient("offline".into()));

        let err = store.list_all("payments").await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.list_all("payments").await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_update_unknown_id_rejected() {
        let store = MemoryStore::new();
        let err = store
            .update("payments", "missing", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Rejected(_)));
    }
}
