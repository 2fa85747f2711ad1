//! Document store contract
//!
//! Everything the deployment engine needs from the application database and
//! the build repository. [`couch::CouchStore`] talks to a live CouchDB over
//! HTTP; [`memory::MemoryStore`] keeps everything in process.

pub mod couch;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::errors::StagehandError;

/// Options for fetching a single document
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Inline attachment bodies instead of stubs
    pub attachments: bool,
}

impl GetOptions {
    pub fn with_attachments() -> Self {
        Self { attachments: true }
    }
}

/// Options for listing documents by id
#[derive(Debug, Clone, Default)]
pub struct AllDocsOptions {
    pub startkey: Option<String>,
    pub endkey: Option<String>,
    pub keys: Option<Vec<String>>,
    pub include_docs: bool,
    pub attachments: bool,
}

/// Options for querying a view
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub startkey: Option<Value>,
    pub endkey: Option<Value>,
    pub descending: bool,
    pub limit: Option<usize>,
}

/// Options for subscribing to the change feed
#[derive(Debug, Clone, Default)]
pub struct ChangesOptions {
    pub ids: Vec<String>,
    pub include_docs: bool,
}

/// One row of an `all_docs` or view response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub key: Value,

    #[serde(default)]
    pub value: Value,

    #[serde(default)]
    pub doc: Option<Value>,

    /// Set when a requested key does not exist
    #[serde(default)]
    pub error: Option<String>,
}

impl Row {
    /// Revision reported for an `all_docs` row, if the document is alive
    pub fn rev(&self) -> Option<&str> {
        if self.value.get("deleted").and_then(Value::as_bool) == Some(true) {
            return None;
        }
        self.value.get("rev").and_then(Value::as_str)
    }
}

/// Per-document outcome of a bulk write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkResult {
    pub id: String,

    #[serde(default)]
    pub rev: Option<String>,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub reason: Option<String>,
}

impl BulkResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Summary of a database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbInfo {
    pub db_name: String,

    #[serde(default)]
    pub doc_count: u64,
}

/// A background job reported by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTask {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub design_document: Option<String>,

    #[serde(default)]
    pub node: Option<String>,

    #[serde(default)]
    pub pid: Option<String>,

    #[serde(default)]
    pub progress: Option<u32>,
}

/// One event of the change feed
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub id: String,
    pub deleted: bool,
    pub doc: Option<Value>,
}

/// A live, cancellable change feed
pub struct Subscription {
    events: mpsc::Receiver<Result<ChangeEvent, StagehandError>>,
    reader: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Wrap a channel fed by `reader`; aborting `reader` ends the feed
    pub fn new(
        events: mpsc::Receiver<Result<ChangeEvent, StagehandError>>,
        reader: Option<JoinHandle<()>>,
    ) -> Self {
        Self { events, reader }
    }

    /// The next change, or `None` once the feed has ended
    pub async fn next(&mut self) -> Option<Result<ChangeEvent, StagehandError>> {
        self.events.recv().await
    }

    /// Stop listening. Events already buffered are discarded.
    pub fn cancel(mut self) {
        self.events.close();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// The operations of a CouchDB-like document database
#[async_trait]
pub trait DocStore: Send + Sync {
    async fn info(&self) -> Result<DbInfo, StagehandError>;

    async fn get(&self, id: &str, options: GetOptions) -> Result<Value, StagehandError>;

    /// Write a document, returning its new revision
    async fn put(&self, doc: &Value) -> Result<String, StagehandError>;

    async fn remove(&self, id: &str, rev: &str) -> Result<(), StagehandError>;

    async fn bulk_write(&self, docs: &[Value]) -> Result<Vec<BulkResult>, StagehandError>;

    async fn all_docs(&self, options: AllDocsOptions) -> Result<Vec<Row>, StagehandError>;

    /// Query a view named `<design>/<view>`
    async fn query(&self, view: &str, options: QueryOptions) -> Result<Vec<Row>, StagehandError>;

    async fn get_attachment(&self, id: &str, name: &str) -> Result<Vec<u8>, StagehandError>;

    async fn changes(&self, options: ChangesOptions) -> Result<Subscription, StagehandError>;

    async fn active_tasks(&self) -> Result<Vec<ActiveTask>, StagehandError>;

    async fn view_cleanup(&self) -> Result<(), StagehandError>;

    async fn compact(&self) -> Result<(), StagehandError>;
}

/// Bulk write where any per-document failure fails the whole call
pub async fn strict_bulk_write(
    store: &dyn DocStore,
    docs: &[Value],
) -> Result<Vec<BulkResult>, StagehandError> {
    let results = store.bulk_write(docs).await?;
    let failures: Vec<String> = results
        .iter()
        .filter(|r| !r.is_ok())
        .map(|r| {
            format!(
                "{}: {} {}",
                r.id,
                r.error.as_deref().unwrap_or_default(),
                r.reason.as_deref().unwrap_or_default()
            )
        })
        .collect();

    if !failures.is_empty() {
        return Err(StagehandError::Deploy(format!(
            "Bulk write failed for {} document(s): {}",
            failures.len(),
            failures.join(", ")
        )));
    }

    Ok(results)
}

/// Id of a JSON document
pub fn doc_id(doc: &Value) -> Option<&str> {
    doc.get("_id").and_then(Value::as_str)
}

/// Revision of a JSON document
pub fn doc_rev(doc: &Value) -> Option<&str> {
    doc.get("_rev").and_then(Value::as_str)
}
