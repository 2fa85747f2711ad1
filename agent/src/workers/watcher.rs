//! Deployment watcher
//!
//! Follows the change feed of the deployment record and runs each new
//! deployment. The feed is cancelled while a deployment runs so the
//! pipeline's own record writes are not mistaken for new requests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::deploy::pipeline::Pipeline;
use crate::errors::StagehandError;
use crate::models::deployment::{
    parse_timestamp, Action, BuildInfo, DeploymentRecord, DEPLOYMENT_RECORD_ID, LEGACY_RECORD_ID,
};
use crate::store::{ChangesOptions, DocStore, GetOptions, Subscription};
use crate::utils::now_millis;

/// Watcher options
#[derive(Debug, Clone)]
pub struct Options {
    /// Namespace given to converted legacy requests
    pub default_namespace: String,

    /// Application given to converted legacy requests
    pub default_application: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            default_namespace: "medic".to_string(),
            default_application: "medic".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LegacyDeployInfo {
    #[serde(default)]
    user: String,

    #[serde(default)]
    timestamp: Value,

    version: String,
}

#[derive(Debug, Deserialize)]
struct LegacyRequest {
    #[serde(rename = "_rev")]
    rev: String,

    deploy_info: LegacyDeployInfo,
}

enum Next {
    Deploy(DeploymentRecord),
    Shutdown,
}

/// The deployment record, if one is waiting to be processed
pub async fn pending_deployment(
    store: &dyn DocStore,
) -> Result<Option<DeploymentRecord>, StagehandError> {
    match store.get(DEPLOYMENT_RECORD_ID, GetOptions::default()).await {
        Ok(doc) => {
            let record = DeploymentRecord::from_value(doc)?;
            Ok(record.is_actionable().then_some(record))
        }
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Rewrite a legacy request document as a deployment record.
///
/// The new record shows up on the feed like any other request.
pub async fn convert_legacy(
    store: &dyn DocStore,
    options: &Options,
    doc: Value,
) -> Result<(), StagehandError> {
    info!("Legacy upgrade request detected, converting");
    let legacy: LegacyRequest = serde_json::from_value(doc)?;

    let mut record = DeploymentRecord::new(
        legacy.deploy_info.user,
        parse_timestamp(&legacy.deploy_info.timestamp).unwrap_or_else(now_millis),
        Action::Install,
        BuildInfo {
            namespace: options.default_namespace.clone(),
            application: options.default_application.clone(),
            version: legacy.deploy_info.version,
        },
    );

    // the legacy request goes only once its replacement is stored
    match store.get(DEPLOYMENT_RECORD_ID, GetOptions::default()).await {
        Ok(existing) => record.rev = existing["_rev"].as_str().map(String::from),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }
    store.put(&record.to_value()?).await?;
    store.remove(LEGACY_RECORD_ID, &legacy.rev).await?;

    info!("Legacy request converted");
    Ok(())
}

async fn subscribe(store: &dyn DocStore) -> Result<Subscription, StagehandError> {
    store
        .changes(ChangesOptions {
            ids: vec![DEPLOYMENT_RECORD_ID.to_string(), LEGACY_RECORD_ID.to_string()],
            include_docs: true,
        })
        .await
}

async fn next_deployment(
    store: &dyn DocStore,
    options: &Options,
    feed: &mut Subscription,
    shutdown_signal: &mut Pin<Box<dyn Future<Output = ()> + Send>>,
) -> Result<Next, StagehandError> {
    loop {
        let change = tokio::select! {
            _ = &mut *shutdown_signal => return Ok(Next::Shutdown),
            change = feed.next() => change,
        };
        let change = change
            .ok_or_else(|| StagehandError::Deploy("Change feed ended unexpectedly".to_string()))??;

        if change.deleted {
            continue;
        }
        let Some(doc) = change.doc else {
            continue;
        };

        if change.id == LEGACY_RECORD_ID {
            convert_legacy(store, options, doc).await?;
            continue;
        }

        let record = DeploymentRecord::from_value(doc)?;
        if record.is_actionable() {
            info!("Change in {} detected", DEPLOYMENT_RECORD_ID);
            return Ok(Next::Deploy(record));
        }
        debug!("Ignoring {} revision {:?}", DEPLOYMENT_RECORD_ID, record.rev);
    }
}

/// Run the watcher until shutdown. Any error is returned and ends watching.
pub async fn run(
    options: &Options,
    store: Arc<dyn DocStore>,
    pipeline: &Pipeline,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) -> Result<(), StagehandError> {
    info!("Watching for deployments...");

    loop {
        let mut feed = subscribe(store.as_ref()).await?;

        // a request written while unsubscribed would otherwise be missed
        let next = match pending_deployment(store.as_ref()).await? {
            Some(record) => Next::Deploy(record),
            None => next_deployment(store.as_ref(), options, &mut feed, &mut shutdown_signal).await?,
        };
        feed.cancel();

        match next {
            Next::Deploy(mut record) => pipeline.run(&mut record, false).await?,
            Next::Shutdown => {
                info!("Watcher shutting down...");
                return Ok(());
            }
        }
    }
}
