//! In-process document store
//!
//! Implements the full [`DocStore`] contract against a map of documents:
//! optimistic revisions, attachments with computed digests, id ranges,
//! registered map views, a live change feed and scripted active tasks.
//! Faults can be injected per operation to exercise recovery paths.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::debug;

use crate::errors::StagehandError;
use crate::store::{
    ActiveTask, AllDocsOptions, BulkResult, ChangeEvent, ChangesOptions, DbInfo, DocStore,
    GetOptions, QueryOptions, Row, Subscription,
};
use crate::utils::content_digest;

/// A map function: emits `(key, value)` pairs for a document
pub type MapFn = Arc<dyn Fn(&Value) -> Vec<(Value, Value)> + Send + Sync>;

/// Store operations that can be counted or made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Info,
    Get,
    Put,
    Remove,
    BulkWrite,
    AllDocs,
    Query,
    GetAttachment,
    Changes,
    ActiveTasks,
    ViewCleanup,
    Compact,
}

/// A failure to return from the next call of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Timeout,
    NotFound,
    Conflict,
    Status(u16),

    /// Bulk writes persist this many documents, then time out
    TimeoutAfter(usize),

    /// Bulk writes refuse the document with this id as `forbidden`; other
    /// operations fail with a 403
    Reject(String),
}

#[derive(Debug, Clone)]
struct Attachment {
    content_type: String,
    data: Vec<u8>,
    digest: String,
}

#[derive(Debug, Clone)]
struct StoredDoc {
    rev: String,
    body: Map<String, Value>,
    attachments: BTreeMap<String, Attachment>,
    deleted: bool,
}

#[derive(Default)]
struct Inner {
    docs: BTreeMap<String, StoredDoc>,
    views: HashMap<String, MapFn>,
    tasks: VecDeque<Vec<ActiveTask>>,
    last_tasks: Vec<ActiveTask>,
    faults: HashMap<Operation, VecDeque<Fault>>,
    calls: HashMap<Operation, usize>,
}

impl Inner {
    fn begin(&mut self, op: Operation) -> Option<Fault> {
        *self.calls.entry(op).or_default() += 1;
        self.faults.get_mut(&op).and_then(VecDeque::pop_front)
    }

    fn alive(&self, id: &str) -> Option<&StoredDoc> {
        self.docs.get(id).filter(|d| !d.deleted)
    }

    /// Apply a single document write, returning `(id, rev)` and the change it caused
    fn write(&mut self, doc: &Value) -> Result<(String, String, ChangeEvent), StagehandError> {
        let mut body = doc
            .as_object()
            .cloned()
            .ok_or_else(|| StagehandError::Validation("Document must be a JSON object".into()))?;

        let id = match body.remove("_id") {
            Some(Value::String(id)) => id,
            _ => uuid::Uuid::new_v4().simple().to_string(),
        };
        let rev = body.remove("_rev").and_then(|r| r.as_str().map(String::from));
        let deleted = body
            .remove("_deleted")
            .and_then(|d| d.as_bool())
            .unwrap_or(false);
        let attachments = body.remove("_attachments");

        let existing = self.docs.get(&id);
        let generation = match existing {
            Some(current) if !current.deleted => {
                if rev.as_deref() != Some(current.rev.as_str()) {
                    return Err(StagehandError::Conflict(id));
                }
                rev_generation(&current.rev)
            }
            Some(tombstone) => {
                if deleted {
                    return Err(StagehandError::NotFound(id));
                }
                rev_generation(&tombstone.rev)
            }
            None => {
                if rev.is_some() || deleted {
                    return Err(StagehandError::Conflict(id));
                }
                0
            }
        };

        let previous = existing
            .filter(|d| !d.deleted)
            .map(|d| d.attachments.clone())
            .unwrap_or_default();
        let attachments = if deleted {
            BTreeMap::new()
        } else {
            parse_attachments(&id, attachments, &previous)?
        };

        let new_rev = format!("{}-{}", generation + 1, uuid::Uuid::new_v4().simple());
        let stored = StoredDoc {
            rev: new_rev.clone(),
            body: if deleted { Map::new() } else { body },
            attachments,
            deleted,
        };

        let change = ChangeEvent {
            id: id.clone(),
            deleted,
            doc: Some(render(&id, &stored, false)),
        };
        self.docs.insert(id.clone(), stored);

        Ok((id, new_rev, change))
    }
}

fn rev_generation(rev: &str) -> u64 {
    rev.split_once('-')
        .and_then(|(generation, _)| generation.parse().ok())
        .unwrap_or(0)
}

fn parse_attachments(
    id: &str,
    value: Option<Value>,
    previous: &BTreeMap<String, Attachment>,
) -> Result<BTreeMap<String, Attachment>, StagehandError> {
    let mut attachments = BTreeMap::new();
    let Some(Value::Object(entries)) = value else {
        return Ok(attachments);
    };

    for (name, entry) in entries {
        if entry.get("stub").and_then(Value::as_bool) == Some(true) {
            let kept = previous.get(&name).cloned().ok_or_else(|| StagehandError::Status {
                status: 412,
                reason: format!("{}: stub for missing attachment {}", id, name),
            })?;
            attachments.insert(name, kept);
            continue;
        }

        let encoded = entry.get("data").and_then(Value::as_str).unwrap_or_default();
        let data = BASE64_STANDARD.decode(encoded)?;
        let content_type = entry
            .get("content_type")
            .and_then(Value::as_str)
            .unwrap_or("application/octet-stream")
            .to_string();
        let digest = content_digest(&data);

        attachments.insert(name, Attachment { content_type, data, digest });
    }

    Ok(attachments)
}

fn render(id: &str, stored: &StoredDoc, with_attachments: bool) -> Value {
    let mut doc = Map::new();
    doc.insert("_id".into(), json!(id));
    doc.insert("_rev".into(), json!(stored.rev));
    if stored.deleted {
        doc.insert("_deleted".into(), json!(true));
        return Value::Object(doc);
    }

    doc.extend(stored.body.clone());
    if !stored.attachments.is_empty() {
        let attachments: Map<String, Value> = stored
            .attachments
            .iter()
            .map(|(name, att)| {
                let mut entry = json!({
                    "content_type": att.content_type,
                    "digest": att.digest,
                    "length": att.data.len(),
                });
                if with_attachments {
                    entry["data"] = json!(BASE64_STANDARD.encode(&att.data));
                } else {
                    entry["stub"] = json!(true);
                }
                (name.clone(), entry)
            })
            .collect();
        doc.insert("_attachments".into(), Value::Object(attachments));
    }

    Value::Object(doc)
}

fn fault_error(fault: Fault, op: Operation) -> StagehandError {
    let what = format!("{:?}", op);
    match fault {
        Fault::Timeout | Fault::TimeoutAfter(_) => StagehandError::Timeout(what),
        Fault::NotFound => StagehandError::NotFound(what),
        Fault::Conflict => StagehandError::Conflict(what),
        Fault::Status(status) => StagehandError::Status {
            status,
            reason: what,
        },
        Fault::Reject(id) => StagehandError::Status {
            status: 403,
            reason: format!("{} rejected {}", what, id),
        },
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// View key ordering: null, booleans, numbers, strings, arrays, objects
pub fn collate(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or_default();
            let y = y.as_f64().unwrap_or_default();
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(a, b)| collate(a, b))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// An in-memory [`DocStore`]
pub struct MemoryStore {
    name: String,
    inner: Mutex<Inner>,
    feed: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        let (feed, _) = broadcast::channel(256);
        Self {
            name: name.into(),
            inner: Mutex::new(Inner::default()),
            feed,
        }
    }

    /// Register a map function answering queries for `<design>/<view>`
    pub async fn register_view(&self, view: &str, map: MapFn) {
        self.inner.lock().await.views.insert(view.to_string(), map);
    }

    /// Queue a snapshot for the next `active_tasks` call. Once the queue is
    /// drained the last snapshot keeps being returned.
    pub async fn push_active_tasks(&self, tasks: Vec<ActiveTask>) {
        self.inner.lock().await.tasks.push_back(tasks);
    }

    /// Make the next call of `op` fail with `fault`
    pub async fn inject_fault(&self, op: Operation, fault: Fault) {
        self.inner
            .lock()
            .await
            .faults
            .entry(op)
            .or_default()
            .push_back(fault);
    }

    /// How many times `op` was called
    pub async fn calls(&self, op: Operation) -> usize {
        self.inner.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    /// Ids of all live documents
    pub async fn ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .docs
            .iter()
            .filter(|(_, d)| !d.deleted)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn publish(&self, change: ChangeEvent) {
        // no receivers is fine
        let _ = self.feed.send(change);
    }
}

#[async_trait]
impl DocStore for MemoryStore {
    async fn info(&self) -> Result<DbInfo, StagehandError> {
        let mut inner = self.inner.lock().await;
        if let Some(fault) = inner.begin(Operation::Info) {
            return Err(fault_error(fault, Operation::Info));
        }
        let doc_count = inner.docs.values().filter(|d| !d.deleted).count() as u64;
        Ok(DbInfo {
            db_name: self.name.clone(),
            doc_count,
        })
    }

    async fn get(&self, id: &str, options: GetOptions) -> Result<Value, StagehandError> {
        let mut inner = self.inner.lock().await;
        if let Some(fault) = inner.begin(Operation::Get) {
            return Err(fault_error(fault, Operation::Get));
        }
        inner
            .alive(id)
            .map(|stored| render(id, stored, options.attachments))
            .ok_or_else(|| StagehandError::NotFound(id.to_string()))
    }

    async fn put(&self, doc: &Value) -> Result<String, StagehandError> {
        let (rev, change) = {
            let mut inner = self.inner.lock().await;
            if let Some(fault) = inner.begin(Operation::Put) {
                return Err(fault_error(fault, Operation::Put));
            }
            let (_, rev, change) = inner.write(doc)?;
            (rev, change)
        };
        self.publish(change);
        Ok(rev)
    }

    async fn remove(&self, id: &str, rev: &str) -> Result<(), StagehandError> {
        let change = {
            let mut inner = self.inner.lock().await;
            if let Some(fault) = inner.begin(Operation::Remove) {
                return Err(fault_error(fault, Operation::Remove));
            }
            if inner.alive(id).is_none() {
                return Err(StagehandError::NotFound(id.to_string()));
            }
            let (_, _, change) = inner.write(&json!({"_id": id, "_rev": rev, "_deleted": true}))?;
            change
        };
        self.publish(change);
        Ok(())
    }

    async fn bulk_write(&self, docs: &[Value]) -> Result<Vec<BulkResult>, StagehandError> {
        let mut changes = Vec::new();
        let outcome = {
            let mut inner = self.inner.lock().await;
            let fault = inner.begin(Operation::BulkWrite);
            let (limit, rejected) = match fault {
                Some(Fault::TimeoutAfter(n)) => (Some(n), None),
                Some(Fault::Reject(id)) => (None, Some(id)),
                Some(other) => return Err(fault_error(other, Operation::BulkWrite)),
                None => (None, None),
            };

            let mut results = Vec::with_capacity(docs.len());
            for doc in docs.iter().take(limit.unwrap_or(docs.len())) {
                let id = crate::store::doc_id(doc).unwrap_or_default().to_string();
                if rejected.as_deref() == Some(id.as_str()) {
                    results.push(BulkResult {
                        id,
                        rev: None,
                        error: Some("forbidden".to_string()),
                        reason: Some("rejected by validation".to_string()),
                    });
                    continue;
                }
                match inner.write(doc) {
                    Ok((id, rev, change)) => {
                        changes.push(change);
                        results.push(BulkResult {
                            id,
                            rev: Some(rev),
                            error: None,
                            reason: None,
                        });
                    }
                    Err(e) => {
                        let error = if e.is_conflict() { "conflict" } else { "forbidden" };
                        results.push(BulkResult {
                            id,
                            rev: None,
                            error: Some(error.to_string()),
                            reason: Some(e.to_string()),
                        });
                    }
                }
            }

            match limit {
                Some(n) => {
                    debug!("Bulk write timed out after {} of {} documents", n, docs.len());
                    Err(StagehandError::Timeout("BulkWrite".into()))
                }
                None => Ok(results),
            }
        };

        for change in changes {
            self.publish(change);
        }
        outcome
    }

    async fn all_docs(&self, options: AllDocsOptions) -> Result<Vec<Row>, StagehandError> {
        let mut inner = self.inner.lock().await;
        if let Some(fault) = inner.begin(Operation::AllDocs) {
            return Err(fault_error(fault, Operation::AllDocs));
        }

        let row = |id: &str, stored: &StoredDoc| {
            let mut value = json!({ "rev": stored.rev });
            if stored.deleted {
                value["deleted"] = json!(true);
            }
            let doc = (options.include_docs && !stored.deleted)
                .then(|| render(id, stored, options.attachments));
            Row {
                id: Some(id.to_string()),
                key: json!(id),
                value,
                doc,
                error: None,
            }
        };

        if let Some(keys) = &options.keys {
            return Ok(keys
                .iter()
                .map(|key| match inner.docs.get(key) {
                    Some(stored) => row(key, stored),
                    None => Row {
                        id: None,
                        key: json!(key),
                        value: Value::Null,
                        doc: None,
                        error: Some("not_found".to_string()),
                    },
                })
                .collect());
        }

        Ok(inner
            .docs
            .iter()
            .filter(|(_, d)| !d.deleted)
            .filter(|(id, _)| options.startkey.as_deref().is_none_or(|s| id.as_str() >= s))
            .filter(|(id, _)| options.endkey.as_deref().is_none_or(|e| id.as_str() <= e))
            .map(|(id, stored)| row(id, stored))
            .collect())
    }

    async fn query(&self, view: &str, options: QueryOptions) -> Result<Vec<Row>, StagehandError> {
        let mut inner = self.inner.lock().await;
        if let Some(fault) = inner.begin(Operation::Query) {
            return Err(fault_error(fault, Operation::Query));
        }

        let (design, _) = view
            .split_once('/')
            .ok_or_else(|| StagehandError::Validation(format!("Bad view name: {}", view)))?;

        let mut rows: Vec<Row> = match inner.views.get(view) {
            Some(map) => inner
                .docs
                .iter()
                .filter(|(id, d)| !d.deleted && !id.starts_with("_design/"))
                .flat_map(|(id, stored)| {
                    let doc = render(id, stored, false);
                    map(&doc).into_iter().map(move |(key, value)| Row {
                        id: Some(id.clone()),
                        key,
                        value,
                        doc: None,
                        error: None,
                    })
                })
                .collect(),
            None if inner.alive(&format!("_design/{}", design)).is_some() => Vec::new(),
            None => return Err(StagehandError::NotFound(view.to_string())),
        };

        rows.sort_by(|a, b| collate(&a.key, &b.key).then_with(|| a.id.cmp(&b.id)));
        if options.descending {
            rows.reverse();
        }

        let in_range = |key: &Value| {
            let (low, high) = if options.descending {
                (&options.endkey, &options.startkey)
            } else {
                (&options.startkey, &options.endkey)
            };
            low.as_ref().is_none_or(|l| collate(key, l).is_ge())
                && high.as_ref().is_none_or(|h| collate(key, h).is_le())
        };

        Ok(rows
            .into_iter()
            .filter(|r| in_range(&r.key))
            .take(options.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn get_attachment(&self, id: &str, name: &str) -> Result<Vec<u8>, StagehandError> {
        let mut inner = self.inner.lock().await;
        if let Some(fault) = inner.begin(Operation::GetAttachment) {
            return Err(fault_error(fault, Operation::GetAttachment));
        }
        inner
            .alive(id)
            .and_then(|stored| stored.attachments.get(name))
            .map(|att| att.data.clone())
            .ok_or_else(|| StagehandError::NotFound(format!("{}/{}", id, name)))
    }

    async fn changes(&self, options: ChangesOptions) -> Result<Subscription, StagehandError> {
        {
            let mut inner = self.inner.lock().await;
            if let Some(fault) = inner.begin(Operation::Changes) {
                return Err(fault_error(fault, Operation::Changes));
            }
        }

        let mut feed = self.feed.subscribe();
        let (tx, rx) = mpsc::channel(64);
        let reader = tokio::spawn(async move {
            loop {
                let change = match feed.recv().await {
                    Ok(change) => change,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !options.ids.is_empty() && !options.ids.contains(&change.id) {
                    continue;
                }
                let change = ChangeEvent {
                    doc: if options.include_docs { change.doc } else { None },
                    ..change
                };
                if tx.send(Ok(change)).await.is_err() {
                    break;
                }
            }
        });

        Ok(Subscription::new(rx, Some(reader)))
    }

    async fn active_tasks(&self) -> Result<Vec<ActiveTask>, StagehandError> {
        let mut inner = self.inner.lock().await;
        if let Some(fault) = inner.begin(Operation::ActiveTasks) {
            return Err(fault_error(fault, Operation::ActiveTasks));
        }
        if let Some(tasks) = inner.tasks.pop_front() {
            inner.last_tasks = tasks;
        }
        Ok(inner.last_tasks.clone())
    }

    async fn view_cleanup(&self) -> Result<(), StagehandError> {
        let mut inner = self.inner.lock().await;
        match inner.begin(Operation::ViewCleanup) {
            Some(fault) => Err(fault_error(fault, Operation::ViewCleanup)),
            None => Ok(()),
        }
    }

    async fn compact(&self) -> Result<(), StagehandError> {
        let mut inner = self.inner.lock().await;
        match inner.begin(Operation::Compact) {
            Some(fault) => Err(fault_error(fault, Operation::Compact)),
            None => Ok(()),
        }
    }
}
