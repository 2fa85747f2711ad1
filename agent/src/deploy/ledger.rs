//! Deployment ledger
//!
//! Every pipeline stage is recorded in the deployment record's log before it
//! runs. After a crash the log tells which stages already finished:
//!
//! * a stage missing from the log has never started: record it, then run it;
//! * a stage that is the last one recorded was interrupted: run it again;
//! * a stage followed by later stages finished: skip it.

use std::sync::Arc;

use tracing::{debug, info};

use crate::errors::StagehandError;
use crate::models::deployment::{DeploymentRecord, LogEntry};
use crate::store::DocStore;
use crate::utils::now_millis;

/// The stages of a deployment, in pipeline order.
///
/// Their keys are persisted in deployment records and must never be renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    PreCleanup,
    Download,
    ExtractDdocs,
    WarmViews,
    Ready,
    Deploy,
    PostCleanup,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Init,
        Stage::PreCleanup,
        Stage::Download,
        Stage::ExtractDdocs,
        Stage::WarmViews,
        Stage::Ready,
        Stage::Deploy,
        Stage::PostCleanup,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Stage::Init => "stage.init",
            Stage::PreCleanup => "stage.pre_cleanup",
            Stage::Download => "stage.download",
            Stage::ExtractDdocs => "stage.extract_ddocs",
            Stage::WarmViews => "stage.warm_views",
            Stage::Ready => "stage.ready",
            Stage::Deploy => "stage.deploy",
            Stage::PostCleanup => "stage.post_cleanup",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Stage::Init => "Deployment of '{{version}}' initialising",
            Stage::PreCleanup => "Pre-deploy cleanup",
            Stage::Download => "Downloading and staging install",
            Stage::ExtractDdocs => "Extracting ddocs",
            Stage::WarmViews => "Warming views",
            Stage::Ready => "View warming complete, ready to deploy",
            Stage::Deploy => "Deploying new installation",
            Stage::PostCleanup => "Post-deploy cleanup, installation complete",
        }
    }
}

/// Records stage progress in a deployment record and gates re-execution
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn DocStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn DocStore>) -> Self {
        Self { store }
    }

    /// Persist the record, keeping its revision current.
    ///
    /// A conflict means another writer touched the record while we own it;
    /// it is returned as is.
    pub async fn update(&self, record: &mut DeploymentRecord) -> Result<(), StagehandError> {
        let rev = self.store.put(&record.to_value()?).await?;
        record.rev = Some(rev);
        Ok(())
    }

    /// Delete the record
    pub async fn delete(&self, record: &mut DeploymentRecord) -> Result<(), StagehandError> {
        record.deleted = true;
        self.update(record).await
    }

    /// Decide whether the stage `key` must run, recording it first if it is new.
    pub async fn enter_key(
        &self,
        record: &mut DeploymentRecord,
        key: &str,
        message: &str,
    ) -> Result<bool, StagehandError> {
        if !record.has_stage(key) {
            info!("Stage: {}", message);
            record.log.push(LogEntry::Stage {
                key: key.to_string(),
                message: message.to_string(),
                datetime: now_millis(),
            });
            self.update(record).await?;
            return Ok(true);
        }

        if record.last_stage_key() == Some(key) {
            info!("Stage: {} (resuming)", message);
            return Ok(true);
        }

        debug!("Skipping {}, a later stage was already recorded", key);
        Ok(false)
    }

    /// Decide whether `stage` must run
    pub async fn enter(
        &self,
        record: &mut DeploymentRecord,
        stage: Stage,
    ) -> Result<bool, StagehandError> {
        let message = stage
            .message()
            .replace("{{version}}", &record.build_info.key());
        self.enter_key(record, stage.key(), &message).await
    }
}
