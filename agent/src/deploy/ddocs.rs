//! Production cutover of staged design documents

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::errors::StagehandError;
use crate::models::ddoc::{production_id, staged_id, STAGED_PREFIX, STAGED_RANGE_END};
use crate::store::{doc_id, strict_bulk_write, AllDocsOptions, DocStore, GetOptions};

/// Document holding the application settings
pub const SETTINGS_DOC_ID: &str = "settings";

/// The staged design documents of one build
#[derive(Debug, Clone)]
pub struct StagedDdocs {
    pub primary: Value,
    pub secondaries: Vec<Value>,
}

pub struct DdocDeployer {
    app: Arc<dyn DocStore>,
}

impl DdocDeployer {
    pub fn new(app: Arc<dyn DocStore>) -> Self {
        Self { app }
    }

    /// Load every staged design document, attachments included, and pick
    /// out the primary one
    pub async fn load_staged(&self, main_ddoc_id: &str) -> Result<StagedDdocs, StagehandError> {
        let primary_id = staged_id(main_ddoc_id);
        let rows = self
            .app
            .all_docs(AllDocsOptions {
                startkey: Some(STAGED_PREFIX.to_string()),
                endkey: Some(STAGED_RANGE_END.to_string()),
                include_docs: true,
                attachments: true,
                ..Default::default()
            })
            .await?;

        let (primaries, secondaries): (Vec<Value>, Vec<Value>) = rows
            .into_iter()
            .filter_map(|row| row.doc)
            .partition(|doc| doc_id(doc) == Some(primary_id.as_str()));

        let primary = primaries.into_iter().next().ok_or_else(|| {
            StagehandError::Deploy(format!("Staged primary ddoc {} not found", primary_id))
        })?;
        Ok(StagedDdocs {
            primary,
            secondaries,
        })
    }

    /// Write staged documents over production, secondaries first
    pub async fn deploy(&self, main_ddoc_id: &str) -> Result<(), StagehandError> {
        let StagedDdocs {
            primary,
            secondaries,
        } = self.load_staged(main_ddoc_id).await?;
        self.deploy_secondaries(secondaries).await?;
        self.deploy_primary(primary).await
    }

    async fn deploy_secondaries(&self, mut docs: Vec<Value>) -> Result<(), StagehandError> {
        if docs.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = docs
            .iter()
            .filter_map(doc_id)
            .map(production_id)
            .collect();
        let deployed = self
            .app
            .all_docs(AllDocsOptions {
                keys: Some(ids),
                ..Default::default()
            })
            .await?;

        for doc in docs.iter_mut() {
            let id = production_id(doc_id(doc).unwrap_or_default());
            let rev = deployed
                .iter()
                .find(|row| row.id.as_deref() == Some(id.as_str()))
                .and_then(|row| row.rev());

            match rev {
                Some(rev) => {
                    debug!("{} already exists, overwriting", id);
                    doc["_rev"] = json!(rev);
                }
                None => {
                    debug!("{} is new, adding", id);
                    if let Some(obj) = doc.as_object_mut() {
                        obj.remove("_rev");
                    }
                }
            }
            doc["_id"] = json!(id);
        }

        strict_bulk_write(self.app.as_ref(), &docs).await?;
        debug!("Secondary ddocs written");
        Ok(())
    }

    async fn deploy_primary(&self, mut doc: Value) -> Result<(), StagehandError> {
        let id = production_id(doc_id(&doc).unwrap_or_default());
        doc["_id"] = json!(id);

        match self.app.get(&id, GetOptions::default()).await {
            Ok(deployed) => {
                debug!("{} exists, upgrading", id);
                doc["_rev"] = deployed["_rev"].clone();
                if let Some(settings) = deployed.get("app_settings").filter(|s| !s.is_null()) {
                    self.migrate_settings(settings.clone()).await?;
                }
            }
            Err(e) if e.is_not_found() => {
                debug!("{} is a fresh install", id);
                if let Some(obj) = doc.as_object_mut() {
                    obj.remove("_rev");
                }
            }
            Err(e) => return Err(e),
        }

        self.app.put(&doc).await?;
        debug!("Primary ddoc written");
        Ok(())
    }

    /// Move settings kept on the old primary into their own document
    async fn migrate_settings(&self, settings: Value) -> Result<(), StagehandError> {
        let mut doc = match self.app.get(SETTINGS_DOC_ID, GetOptions::default()).await {
            Ok(doc) => doc,
            Err(e) if e.is_not_found() => {
                debug!("No settings doc found, creating one");
                json!({ "_id": SETTINGS_DOC_ID })
            }
            Err(e) => return Err(e),
        };
        doc["settings"] = settings;
        self.app.put(&doc).await?;
        debug!("Settings doc updated");
        Ok(())
    }
}
