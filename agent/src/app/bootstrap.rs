//! Pre-boot checks and deployment requests from the command line

use tracing::{debug, info};

use crate::app::options::DeploymentRequest;
use crate::deploy::ledger::Ledger;
use crate::errors::StagehandError;
use crate::models::deployment::{Action, DeploymentRecord, DEPLOYMENT_RECORD_ID};
use crate::models::package::PackageDescriptor;
use crate::store::{doc_rev, DocStore, GetOptions};
use crate::utils::now_millis;

/// User recorded on requests written by this tool
pub const CLI_USER: &str = "stagehand cli";

/// Make sure the application database can be deployed to.
///
/// The build repository is not checked: running offline with an already
/// staged build is valid.
pub async fn pre_boot_checks(app: &dyn DocStore) -> Result<(), StagehandError> {
    debug!("Running pre-boot checks");
    app.info()
        .await
        .map_err(|e| StagehandError::Config(format!("Cannot locate app db: {}", e)))?;
    app.active_tasks().await.map_err(|e| {
        StagehandError::Config(format!(
            "The application server must report active tasks to deploy on it: {}",
            e
        ))
    })?;
    debug!("Pre-boot checks OK");
    Ok(())
}

async fn existing_record(app: &dyn DocStore) -> Result<Option<serde_json::Value>, StagehandError> {
    match app.get(DEPLOYMENT_RECORD_ID, GetOptions::default()).await {
        Ok(doc) => Ok(Some(doc)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

async fn request_deploy(
    app: &dyn DocStore,
    builds: &dyn DocStore,
    ledger: &Ledger,
    action: Action,
    package: PackageDescriptor,
) -> Result<DeploymentRecord, StagehandError> {
    info!("Requesting {:?} of {}", action, package);
    let existing = existing_record(app).await?;
    let package = package.resolve(builds).await?;

    let mut record = DeploymentRecord::new(CLI_USER, now_millis(), action, package.into());
    record.rev = existing.as_ref().and_then(doc_rev).map(String::from);
    ledger.update(&mut record).await?;
    Ok(record)
}

async fn request_complete(
    app: &dyn DocStore,
    ledger: &Ledger,
) -> Result<DeploymentRecord, StagehandError> {
    let doc = existing_record(app).await?.ok_or_else(|| {
        StagehandError::InvalidRequest("There is no installation to complete".to_string())
    })?;
    let mut record = DeploymentRecord::from_value(doc)?;
    if !record.staging_complete {
        return Err(StagehandError::InvalidRequest(
            "A deploy exists but it is not ready to complete".to_string(),
        ));
    }

    info!("Requesting completion of {}", record.build_info.key());
    record.action = Some(Action::Complete);
    ledger.update(&mut record).await?;
    Ok(record)
}

/// Write the deployment record for a command line request
pub async fn write_request(
    app: &dyn DocStore,
    builds: &dyn DocStore,
    ledger: &Ledger,
    request: &DeploymentRequest,
    default_namespace: &str,
    default_application: &str,
) -> Result<DeploymentRecord, StagehandError> {
    match request {
        DeploymentRequest::Install(descriptor) => {
            let package =
                PackageDescriptor::parse(descriptor, default_namespace, default_application)?;
            request_deploy(app, builds, ledger, Action::Install, package).await
        }
        DeploymentRequest::Stage(descriptor) => {
            let package =
                PackageDescriptor::parse(descriptor, default_namespace, default_application)?;
            request_deploy(app, builds, ledger, Action::Stage, package).await
        }
        DeploymentRequest::Complete => request_complete(app, ledger).await,
    }
}
