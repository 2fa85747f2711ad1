//! The deployment pipeline
//!
//! Runs the stages a deployment record asks for, each gated by the ledger so
//! a restarted process resumes at the first unfinished stage.

use std::sync::Arc;

use tracing::{debug, info};

use crate::deploy::apps::AppDeployer;
use crate::deploy::ddocs::DdocDeployer;
use crate::deploy::ledger::{Ledger, Stage};
use crate::deploy::stager::Stager;
use crate::deploy::warmer::{Warmer, WarmerOptions};
use crate::errors::StagehandError;
use crate::filesys::lockfile::Lockfile;
use crate::models::ddoc::{declared_apps, staged_id, App};
use crate::models::deployment::{Action, DeploymentRecord};
use crate::process::lifecycle::Lifecycle;
use crate::storage::layout::DeploymentLayout;
use crate::store::{DocStore, GetOptions};

/// Everything a pipeline works with
pub struct PipelineContext {
    pub app: Arc<dyn DocStore>,
    pub builds: Arc<dyn DocStore>,
    pub layout: DeploymentLayout,
    pub lifecycle: Lifecycle,
    pub lock: Arc<Lockfile>,
    pub warmer: WarmerOptions,
}

pub struct Pipeline {
    app: Arc<dyn DocStore>,
    ledger: Ledger,
    stager: Stager,
    warmer: Warmer,
    ddocs: DdocDeployer,
    apps: AppDeployer,
    lifecycle: Lifecycle,
    lock: Arc<Lockfile>,
}

impl Pipeline {
    pub fn new(ctx: PipelineContext) -> Self {
        let ledger = Ledger::new(ctx.app.clone());
        Self {
            stager: Stager::new(ctx.app.clone(), ctx.builds, ledger.clone()),
            warmer: Warmer::new(ctx.app.clone(), ledger.clone(), ctx.warmer),
            ddocs: DdocDeployer::new(ctx.app.clone()),
            apps: AppDeployer::new(ctx.layout),
            lifecycle: ctx.lifecycle,
            lock: ctx.lock,
            app: ctx.app,
            ledger,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn apps(&self) -> &AppDeployer {
        &self.apps
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Carry out what `record` asks for.
    ///
    /// On a first run (the record existed when the process started) apps are
    /// started after cutover even when none of them changed.
    pub async fn run(
        &self,
        record: &mut DeploymentRecord,
        first_run: bool,
    ) -> Result<(), StagehandError> {
        record.check_schema()?;
        info!(
            "Processing {} of {}",
            format!("{:?}", record.action()).to_lowercase(),
            record.build_info.key()
        );

        match record.action() {
            Action::Install => {
                self.stage_build(record).await?;
                self.cut_over(record, first_run).await?;
            }
            Action::Stage => {
                self.stage_build(record).await?;
                record.staging_complete = true;
                self.ledger.update(record).await?;
                info!("{} is staged and ready to complete", record.build_info.key());
            }
            Action::Complete => self.cut_over(record, first_run).await?,
        }
        Ok(())
    }

    /// Download, unpack and warm the build without touching production
    async fn stage_build(&self, record: &mut DeploymentRecord) -> Result<(), StagehandError> {
        self.ledger.enter(record, Stage::Init).await?;

        if self.ledger.enter(record, Stage::PreCleanup).await? {
            self.stager.pre_cleanup().await?;
        }
        if self.ledger.enter(record, Stage::Download).await? {
            self.stager.download_build(record).await?;
        }
        if self.ledger.enter(record, Stage::ExtractDdocs).await? {
            self.stager.extract_ddocs(record).await?;
        }
        if self.ledger.enter(record, Stage::WarmViews).await? {
            self.warmer.warm(record).await?;
        }

        self.ledger.enter(record, Stage::Ready).await?;
        Ok(())
    }

    /// Put the staged build into production and clean up after it
    async fn cut_over(
        &self,
        record: &mut DeploymentRecord,
        first_run: bool,
    ) -> Result<(), StagehandError> {
        if self.ledger.enter(record, Stage::Deploy).await? {
            self.deploy(record, first_run).await?;
        }
        if self.ledger.enter(record, Stage::PostCleanup).await? {
            self.post_cleanup(record).await?;
        }
        info!("Deployment of {} complete", record.build_info.key());
        Ok(())
    }

    async fn deploy(&self, record: &DeploymentRecord, first_run: bool) -> Result<(), StagehandError> {
        let staged = staged_id(&record.main_ddoc_id());
        let primary = self.app.get(&staged, GetOptions::default()).await?;
        let apps = declared_apps(&primary)?;
        let changed = self.apps.changed_apps(&apps).await?;

        self.lock.wait().await?;
        let result = self
            .deploy_locked(record, &staged, &apps, &changed, first_run)
            .await;
        self.lock.release();
        result
    }

    async fn deploy_locked(
        &self,
        record: &DeploymentRecord,
        staged: &str,
        apps: &[App],
        changed: &[App],
        first_run: bool,
    ) -> Result<(), StagehandError> {
        let names: Vec<String> = apps.iter().map(|a| a.name.clone()).collect();

        if changed.is_empty() {
            debug!("No apps to deploy");
        } else {
            info!("Unpacking changed apps to {}", self.apps.layout().root().path().display());
            for app in changed {
                self.apps.unpack(self.app.as_ref(), staged, app).await?;
            }
            self.lifecycle.stop(&names).await?;
        }

        info!("Deploying staged ddocs");
        self.ddocs.deploy(&record.main_ddoc_id()).await?;

        if !changed.is_empty() {
            info!("Updating symlinks for changed apps");
            for app in changed {
                self.apps.swap(app).await?;
            }
        }

        if !changed.is_empty() || first_run {
            self.lifecycle.start(&names).await?;
        }
        Ok(())
    }

    /// Reclaim replaced builds and staged documents, then drop the record.
    ///
    /// Apps are read from the production primary so this stage can run again
    /// after the staged documents are gone.
    async fn post_cleanup(&self, record: &mut DeploymentRecord) -> Result<(), StagehandError> {
        match self.app.get(&record.main_ddoc_id(), GetOptions::default()).await {
            Ok(primary) => {
                for app in declared_apps(&primary)? {
                    self.apps.prune(&app.name).await?;
                }
            }
            Err(e) if e.is_not_found() => debug!("No production primary, nothing to prune"),
            Err(e) => return Err(e),
        }

        self.stager.clear_staged().await?;
        self.app.view_cleanup().await?;
        self.ledger.delete(record).await
    }
}
