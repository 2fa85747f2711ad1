//! Main application run loop

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::app::bootstrap;
use crate::app::options::AppOptions;
use crate::deploy::pipeline::{Pipeline, PipelineContext};
use crate::errors::StagehandError;
use crate::filesys::lockfile::Lockfile;
use crate::store::couch::CouchStore;
use crate::store::DocStore;
use crate::workers::watcher;

/// Run stagehand until the work is done, a fatal error occurs or
/// `shutdown_signal` fires.
///
/// The lock is released on every way out. Apps this process started are
/// stopped only when it is shut down by a signal.
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), StagehandError> {
    info!("Initializing stagehand...");

    let lock = Arc::new(Lockfile::new(options.storage.layout.lock_file()));
    if lock.exists()? {
        return Err(StagehandError::Lock(format!(
            "Lock file already exists at {}. Cannot start.",
            lock.path().display()
        )));
    }
    let lifecycle = options.mode.lifecycle()?;

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    let worker_signal: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
        let _ = shutdown_rx.recv().await;
    });

    let work = serve(&options, lock.clone(), lifecycle.clone(), worker_signal);
    tokio::pin!(work);

    let result = tokio::select! {
        result = &mut work => result,
        _ = shutdown_signal => {
            info!("Shutdown signal received, shutting down...");
            let _ = shutdown_tx.send(());

            // a deployment in flight is abandoned here and resumed on restart
            let result = match tokio::time::timeout(options.max_shutdown_delay, &mut work).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Still busy after {:?}, exiting anyway", options.max_shutdown_delay);
                    Ok(())
                }
            };
            if options.manages_apps() {
                lifecycle.stop_sync(&lifecycle.running());
            }
            result
        }
    };

    if let Err(e) = &result {
        error!("********FATAL********");
        error!("{}", e);
    }
    lock.release();
    result
}

async fn serve(
    options: &AppOptions,
    lock: Arc<Lockfile>,
    lifecycle: crate::process::lifecycle::Lifecycle,
    shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) -> Result<(), StagehandError> {
    let app_db = CouchStore::new(&options.couch_url, options.query_timeout)?;
    let builds_db = CouchStore::new(&options.builds_url, options.query_timeout)?;
    info!("Application database: {}", app_db.url());
    info!("Build repository: {}", builds_db.url());

    let app: Arc<dyn DocStore> = Arc::new(app_db);
    let builds: Arc<dyn DocStore> = Arc::new(builds_db);

    bootstrap::pre_boot_checks(app.as_ref()).await?;

    let layout = options.mode.layout();
    layout.root().create().await?;
    let pipeline = Pipeline::new(PipelineContext {
        app: app.clone(),
        builds: builds.clone(),
        layout,
        lifecycle,
        lock,
        warmer: options.warmer.clone(),
    });

    if let Some(request) = &options.request {
        bootstrap::write_request(
            app.as_ref(),
            builds.as_ref(),
            pipeline.ledger(),
            request,
            &options.watcher.default_namespace,
            &options.watcher.default_application,
        )
        .await?;
    }

    boot(options, app, &pipeline, shutdown_signal).await
}

/// Start installed apps, finish any deployment waiting at boot, then watch
/// for new ones when running as a daemon
pub async fn boot(
    options: &AppOptions,
    app: Arc<dyn DocStore>,
    pipeline: &Pipeline,
    shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) -> Result<(), StagehandError> {
    if options.manages_apps() {
        let installed = pipeline.apps().installed_apps().await?;
        pipeline.lifecycle().start(&installed).await?;
    }

    match watcher::pending_deployment(app.as_ref()).await? {
        Some(mut record) => pipeline.run(&mut record, true).await?,
        None => info!("No deployments to make upon boot"),
    }

    if options.daemon {
        watcher::run(&options.watcher, app, pipeline, shutdown_signal).await?;
    }
    Ok(())
}
