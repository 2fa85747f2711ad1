//! CouchDB HTTP client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use url::Url;

use crate::errors::StagehandError;
use crate::store::{
    ActiveTask, AllDocsOptions, BulkResult, ChangeEvent, ChangesOptions, DbInfo, DocStore,
    GetOptions, QueryOptions, Row, Subscription,
};

/// Interval at which the server sends keep-alive newlines on the change feed
const FEED_HEARTBEAT_MILLIS: u64 = 10_000;

/// A CouchDB database reached over HTTP
pub struct CouchStore {
    client: Client,
    feed_client: Client,
    db_url: Url,
    server_url: Url,
    username: Option<String>,
    password: Option<SecretString>,
}

impl CouchStore {
    /// Create a client for the database at `db_url`.
    ///
    /// Credentials embedded in the URL are removed from it and sent as basic
    /// auth instead. `timeout` bounds every request except the change feed.
    pub fn new(db_url: &str, timeout: Duration) -> Result<Self, StagehandError> {
        let mut url = Url::parse(db_url)
            .map_err(|e| StagehandError::Config(format!("Invalid database URL: {}", e)))?;

        let username = (!url.username().is_empty()).then(|| url.username().to_string());
        let password = url.password().map(|p| SecretString::from(p.to_string()));
        url.set_username("")
            .and_then(|_| url.set_password(None))
            .map_err(|_| StagehandError::Config("Database URL cannot carry credentials".into()))?;

        // The database is the last path segment; anything before it is a
        // prefix the server is mounted under (e.g. behind a proxy)
        let mut segments: Vec<String> = url
            .path_segments()
            .ok_or_else(|| StagehandError::Config("Database URL cannot be a base".into()))?
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        let db_name = segments
            .pop()
            .ok_or_else(|| StagehandError::Config("Database URL has no database name".into()))?;

        url.set_query(None);
        url.set_fragment(None);
        let mut server_url = url.clone();
        server_url
            .path_segments_mut()
            .map_err(|_| StagehandError::Config("Database URL cannot be a base".into()))?
            .clear()
            .extend(&segments);
        let mut db_url = server_url.clone();
        if let Ok(mut path) = db_url.path_segments_mut() {
            path.pop_if_empty().push(&db_name);
        }

        let client = Client::builder().timeout(timeout).build()?;
        let feed_client = Client::builder().build()?;

        Ok(Self {
            client,
            feed_client,
            db_url,
            server_url,
            username,
            password,
        })
    }

    /// The database URL, safe to log
    pub fn url(&self) -> &str {
        self.db_url.as_str()
    }

    fn url_for(&self, segments: &[&str]) -> Url {
        let mut url = self.db_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.extend(segments);
        }
        url
    }

    /// A server-level endpoint, under any path prefix the database sits behind
    fn server_url_for(&self, endpoint: &str) -> Url {
        let mut url = self.server_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push(endpoint);
        }
        url
    }

    /// Design document ids keep their slash; everything else is one segment
    fn doc_url(&self, id: &str, rest: &[&str]) -> Url {
        let mut segments: Vec<&str> = match id.strip_prefix("_design/") {
            Some(name) => vec!["_design", name],
            None => vec![id],
        };
        segments.extend_from_slice(rest);
        self.url_for(&segments)
    }

    fn request(&self, client: &Client, method: Method, url: Url) -> RequestBuilder {
        debug!("{} {}", method, url);
        let request = client
            .request(method, url)
            .header(header::ACCEPT, "application/json");
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_ref().map(|p| p.expose_secret())),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, StagehandError> {
        let response = request.send().await.map_err(classify)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let reason = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => StagehandError::NotFound(reason),
            StatusCode::CONFLICT => StagehandError::Conflict(reason),
            _ => {
                if status.is_server_error() {
                    error!("Store request failed: {} - {}", status, reason);
                }
                StagehandError::Status {
                    status: status.as_u16(),
                    reason,
                }
            }
        })
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, StagehandError> {
        let response = self.send(request).await?;
        response.json().await.map_err(classify)
    }
}

fn classify(e: reqwest::Error) -> StagehandError {
    if e.is_timeout() {
        StagehandError::Timeout(e.to_string())
    } else {
        StagehandError::HttpError(e)
    }
}

fn json_param(value: &impl serde::Serialize) -> Result<String, StagehandError> {
    Ok(serde_json::to_string(value)?)
}

#[derive(Deserialize)]
struct RowsResponse {
    rows: Vec<Row>,
}

#[derive(Deserialize)]
struct WriteResponse {
    rev: String,
}

#[derive(Deserialize)]
struct FeedLine {
    #[serde(default)]
    id: Option<String>,

    #[serde(default)]
    deleted: bool,

    #[serde(default)]
    doc: Option<Value>,
}

/// Parse one line of a continuous change feed; heartbeats and the trailing
/// `last_seq` line yield nothing
fn parse_feed_line(line: &str) -> Result<Option<ChangeEvent>, StagehandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let parsed: FeedLine = serde_json::from_str(line)?;
    Ok(parsed.id.map(|id| ChangeEvent {
        id,
        deleted: parsed.deleted,
        doc: parsed.doc,
    }))
}

#[async_trait]
impl DocStore for CouchStore {
    async fn info(&self) -> Result<DbInfo, StagehandError> {
        let request = self.request(&self.client, Method::GET, self.db_url.clone());
        self.send_json(request).await
    }

    async fn get(&self, id: &str, options: GetOptions) -> Result<Value, StagehandError> {
        let mut request = self.request(&self.client, Method::GET, self.doc_url(id, &[]));
        if options.attachments {
            request = request.query(&[("attachments", "true")]);
        }
        self.send_json(request).await
    }

    async fn put(&self, doc: &Value) -> Result<String, StagehandError> {
        let id = crate::store::doc_id(doc)
            .ok_or_else(|| StagehandError::Validation("Document has no _id".into()))?;
        let request = self
            .request(&self.client, Method::PUT, self.doc_url(id, &[]))
            .json(doc);
        let written: WriteResponse = self.send_json(request).await?;
        Ok(written.rev)
    }

    async fn remove(&self, id: &str, rev: &str) -> Result<(), StagehandError> {
        let request = self
            .request(&self.client, Method::DELETE, self.doc_url(id, &[]))
            .query(&[("rev", rev)]);
        self.send(request).await?;
        Ok(())
    }

    async fn bulk_write(&self, docs: &[Value]) -> Result<Vec<BulkResult>, StagehandError> {
        let request = self
            .request(&self.client, Method::POST, self.url_for(&["_bulk_docs"]))
            .json(&json!({ "docs": docs }));
        self.send_json(request).await
    }

    async fn all_docs(&self, options: AllDocsOptions) -> Result<Vec<Row>, StagehandError> {
        let url = self.url_for(&["_all_docs"]);
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(startkey) = &options.startkey {
            params.push(("startkey", json_param(startkey)?));
        }
        if let Some(endkey) = &options.endkey {
            params.push(("endkey", json_param(endkey)?));
        }
        if options.include_docs {
            params.push(("include_docs", "true".into()));
        }
        if options.attachments {
            params.push(("attachments", "true".into()));
        }

        let request = match &options.keys {
            Some(keys) => self
                .request(&self.client, Method::POST, url)
                .query(&params)
                .json(&json!({ "keys": keys })),
            None => self.request(&self.client, Method::GET, url).query(&params),
        };
        let response: RowsResponse = self.send_json(request).await?;
        Ok(response.rows)
    }

    async fn query(&self, view: &str, options: QueryOptions) -> Result<Vec<Row>, StagehandError> {
        let (design, name) = view
            .split_once('/')
            .ok_or_else(|| StagehandError::Validation(format!("Bad view name: {}", view)))?;
        let url = self.url_for(&["_design", design, "_view", name]);

        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(startkey) = &options.startkey {
            params.push(("startkey", json_param(startkey)?));
        }
        if let Some(endkey) = &options.endkey {
            params.push(("endkey", json_param(endkey)?));
        }
        if options.descending {
            params.push(("descending", "true".into()));
        }
        if let Some(limit) = options.limit {
            params.push(("limit", limit.to_string()));
        }

        let request = self.request(&self.client, Method::GET, url).query(&params);
        let response: RowsResponse = self.send_json(request).await?;
        Ok(response.rows)
    }

    async fn get_attachment(&self, id: &str, name: &str) -> Result<Vec<u8>, StagehandError> {
        let request = self
            .request(&self.client, Method::GET, self.doc_url(id, &[name]))
            .header(header::ACCEPT, "*/*");
        let response = self.send(request).await?;
        let bytes = response.bytes().await.map_err(classify)?;
        Ok(bytes.to_vec())
    }

    async fn changes(&self, options: ChangesOptions) -> Result<Subscription, StagehandError> {
        let mut params: Vec<(&str, String)> = vec![
            ("feed", "continuous".into()),
            ("since", "now".into()),
            ("heartbeat", FEED_HEARTBEAT_MILLIS.to_string()),
        ];
        if !options.ids.is_empty() {
            params.push(("filter", "_doc_ids".into()));
            params.push(("doc_ids", json_param(&options.ids)?));
        }
        if options.include_docs {
            params.push(("include_docs", "true".into()));
        }

        let request = self
            .request(&self.feed_client, Method::GET, self.url_for(&["_changes"]))
            .query(&params);
        let mut response = self.send(request).await?;

        let (tx, rx) = mpsc::channel(64);
        let reader = tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();
            loop {
                let chunk = match response.chunk().await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(classify(e))).await;
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let event = match parse_feed_line(&String::from_utf8_lossy(&line)) {
                        Ok(Some(event)) => Ok(event),
                        Ok(None) => continue,
                        Err(e) => {
                            warn!("Unreadable change feed line: {}", e);
                            Err(e)
                        }
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            debug!("Change feed closed");
        });

        Ok(Subscription::new(rx, Some(reader)))
    }

    async fn active_tasks(&self) -> Result<Vec<ActiveTask>, StagehandError> {
        let url = self.server_url_for("_active_tasks");
        let request = self.request(&self.client, Method::GET, url);
        self.send_json(request).await
    }

    async fn view_cleanup(&self) -> Result<(), StagehandError> {
        let request = self
            .request(&self.client, Method::POST, self.url_for(&["_view_cleanup"]))
            .json(&json!({}));
        self.send(request).await?;
        Ok(())
    }

    async fn compact(&self) -> Result<(), StagehandError> {
        let request = self
            .request(&self.client, Method::POST, self.url_for(&["_compact"]))
            .json(&json!({}));
        self.send(request).await?;
        Ok(())
    }
}
