//! Build staging
//!
//! Downloads a build into the application database under its staged id and
//! unpacks the design documents it bundles next to it.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::deploy::ledger::Ledger;
use crate::errors::StagehandError;
use crate::models::ddoc::{stage_doc, staged_id, STAGED_PREFIX, STAGED_RANGE_END};
use crate::models::deployment::DeploymentRecord;
use crate::store::{doc_id, doc_rev, AllDocsOptions, DocStore, GetOptions};
use crate::utils::now_millis;

/// Attachment listing the secondary design documents of a build
pub const COMPILED_DDOCS: &str = "ddocs/compiled.json";

#[derive(Deserialize)]
struct CompiledDdocs {
    #[serde(default)]
    docs: Vec<Value>,
}

pub struct Stager {
    app: Arc<dyn DocStore>,
    builds: Arc<dyn DocStore>,
    ledger: Ledger,
}

impl Stager {
    pub fn new(app: Arc<dyn DocStore>, builds: Arc<dyn DocStore>, ledger: Ledger) -> Self {
        Self { app, builds, ledger }
    }

    /// All staged design documents, optionally with their bodies
    pub async fn staged_docs(
        &self,
        include_docs: bool,
        attachments: bool,
    ) -> Result<Vec<Value>, StagehandError> {
        let rows = self
            .app
            .all_docs(AllDocsOptions {
                startkey: Some(STAGED_PREFIX.to_string()),
                endkey: Some(STAGED_RANGE_END.to_string()),
                include_docs,
                attachments,
                ..Default::default()
            })
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match row.doc {
                Some(doc) if include_docs => Some(doc),
                _ => {
                    let rev = row.rev()?.to_string();
                    Some(json!({ "_id": row.id?, "_rev": rev }))
                }
            })
            .collect())
    }

    /// Delete every staged design document
    pub async fn clear_staged(&self) -> Result<(), StagehandError> {
        let mut stubs = self.staged_docs(false, false).await?;
        if stubs.is_empty() {
            return Ok(());
        }

        for stub in stubs.iter_mut() {
            stub["_deleted"] = json!(true);
        }
        debug!(
            "Deleting staged ddocs: {:?}",
            stubs.iter().filter_map(doc_id).collect::<Vec<_>>()
        );
        crate::store::strict_bulk_write(self.app.as_ref(), &stubs).await?;
        Ok(())
    }

    /// Remove leftovers of an earlier attempt and tidy the database
    pub async fn pre_cleanup(&self) -> Result<(), StagehandError> {
        self.clear_staged().await?;
        self.app.view_cleanup().await?;
        self.app.compact().await?;
        Ok(())
    }

    /// Fetch the requested build and store it as the staged primary design
    /// document.
    ///
    /// A build the repository refuses to serve makes the whole request
    /// invalid: the record is deleted and `InvalidRequest` returned.
    pub async fn download_build(
        &self,
        record: &mut DeploymentRecord,
    ) -> Result<(), StagehandError> {
        let key = record.build_info.key();
        debug!("Downloading build {}", key);

        let mut build = match self.builds.get(&key, GetOptions::with_attachments()).await {
            Ok(build) => build,
            Err(e) if e.is_client_error() => {
                warn!("Build {} cannot be fetched ({}), removing the request", key, e);
                self.ledger.delete(record).await?;
                return Err(StagehandError::InvalidRequest(format!(
                    "Build {} is not available: {}",
                    key, e
                )));
            }
            Err(e) => return Err(e),
        };

        build["_id"] = json!(record.main_ddoc_id());
        stage_doc(&mut build);
        build["deploy_info"] = json!({
            "timestamp": now_millis(),
            "user": record.user,
            "version": record.build_info.version,
        });

        // an interrupted earlier run may already have staged it
        let staged = staged_id(&record.main_ddoc_id());
        match self.app.get(&staged, GetOptions::default()).await {
            Ok(existing) => {
                if let Some(rev) = doc_rev(&existing) {
                    build["_rev"] = json!(rev);
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        self.app.put(&build).await?;
        info!("Staged {} as {}", key, staged);
        Ok(())
    }

    /// Store the design documents bundled with the staged build, staged too
    pub async fn extract_ddocs(&self, record: &DeploymentRecord) -> Result<(), StagehandError> {
        let staged = staged_id(&record.main_ddoc_id());
        let primary = self.app.get(&staged, GetOptions::with_attachments()).await?;

        let bundle = format!("ddocs/{}.json", record.build_info.application);
        let attachment = [COMPILED_DDOCS, bundle.as_str()]
            .into_iter()
            .find(|name| primary.get("_attachments").and_then(|a| a.get(*name)).is_some());

        let mut docs = match attachment {
            Some(name) => {
                let data = self.app.get_attachment(&staged, name).await?;
                let compiled: CompiledDdocs = serde_json::from_slice(&data)?;
                compiled.docs
            }
            None => {
                debug!("{} bundles no design documents", staged);
                Vec::new()
            }
        };

        for doc in docs.iter_mut() {
            stage_doc(doc);
        }
        docs.push(primary);
        debug!(
            "Storing staged: {:?}",
            docs.iter().filter_map(doc_id).collect::<Vec<_>>()
        );

        self.write_staged(&docs).await
    }

    async fn write_staged(&self, docs: &[Value]) -> Result<(), StagehandError> {
        match self.app.bulk_write(docs).await {
            Ok(results) => {
                // a conflict means an interrupted earlier run already stored
                // the document; any other refusal leaves it out of the build
                let mut refused = Vec::new();
                for result in results.iter().filter(|r| !r.is_ok()) {
                    match result.error.as_deref() {
                        Some("conflict") => debug!("{} already stored", result.id),
                        error => refused.push(format!(
                            "{}: {} {}",
                            result.id,
                            error.unwrap_or_default(),
                            result.reason.as_deref().unwrap_or_default()
                        )),
                    }
                }
                if refused.is_empty() {
                    Ok(())
                } else {
                    Err(StagehandError::Deploy(format!(
                        "Staged ddocs were refused: {}",
                        refused.join(", ")
                    )))
                }
            }
            Err(e) if e.is_timeout() => {
                warn!("Bulk write of staged ddocs timed out, writing them one by one");
                self.write_one_by_one(docs).await
            }
            Err(e) => Err(e),
        }
    }

    /// The timed out bulk write may have stored some documents already, so
    /// only missing ones are written and a conflict counts as written.
    async fn write_one_by_one(&self, docs: &[Value]) -> Result<(), StagehandError> {
        for doc in docs {
            let id = doc_id(doc).unwrap_or_default();
            match self.app.get(id, GetOptions::default()).await {
                Ok(_) => {
                    debug!("{} already stored", id);
                    continue;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }

            match self.app.put(doc).await {
                Ok(_) => debug!("{} stored", id),
                Err(e) if e.is_conflict() => debug!("{} was stored concurrently", id),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
