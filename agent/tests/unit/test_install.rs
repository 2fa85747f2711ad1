use std::future::pending;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use stagehand::app::bootstrap::write_request;
use stagehand::app::options::{AppOptions, DeploymentRequest, ModeProfile, StorageOptions};
use stagehand::app::run::boot;
use stagehand::deploy::ledger::Stage;
use stagehand::filesys::file::File;
use stagehand::filesys::lockfile::Lockfile;
use stagehand::models::deployment::{Action, DEPLOYMENT_RECORD_ID};
use stagehand::process::lifecycle::Lifecycle;
use stagehand::storage::layout::DeploymentLayout;
use stagehand::storage::settings::Mode;
use stagehand::store::memory::{MemoryStore, Operation};
use stagehand::store::{DocStore, GetOptions};
use stagehand::utils::content_digest;
use stagehand::workers::watcher::{self, pending_deployment};

use crate::helpers::{
    build_doc, fast_warmer, pipeline, pipeline_with, record, releases_view, sh, tgz,
};

const API_V1: &str = "test-app-api-1.0.0.tgz";
const API_V2: &str = "test-app-api-1.1.0.tgz";
const SENTINEL: &str = "test-app-sentinel-1.0.0.tgz";

fn layout(root: &Path) -> DeploymentLayout {
    DeploymentLayout::new(root.join("deployments"))
}

fn build_path(root: &Path, app: &str, bundle: &[u8]) -> std::path::PathBuf {
    layout(root)
        .app_dir(app)
        .subdir(&content_digest(bundle).replace('/', ""))
        .path()
        .to_path_buf()
}

/// A lifecycle appending `start <app>` lines to `<root>/starts.log`
fn logging_lifecycle(root: &Path) -> Lifecycle {
    let log = root.join("starts.log");
    Lifecycle::new(
        sh(&format!("echo start {{{{app}}}} >> {}", log.display())),
        sh("true"),
    )
    .unwrap()
}

async fn starts(root: &Path) -> Vec<String> {
    let log = File::new(root.join("starts.log"));
    if !log.exists().await {
        return Vec::new();
    }
    log.read_string()
        .await
        .unwrap()
        .lines()
        .map(String::from)
        .collect()
}

async fn deployed_version(app: &MemoryStore) -> String {
    let primary = app
        .get("_design/test-app-1", GetOptions::default())
        .await
        .unwrap();
    primary["deploy_info"]["version"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_install_deploys_build() {
    let tmp = tempfile::tempdir().unwrap();
    let app = Arc::new(MemoryStore::new("medic"));
    let builds = Arc::new(MemoryStore::new("builds"));
    let bundle = tgz(&[
        ("index.js", "console.log('v1');"),
        ("lib/util.js", "module.exports = {};"),
    ]);
    builds
        .put(&build_doc("test:test-app-1:1.0.0", &[(API_V1, &bundle[..])]))
        .await
        .unwrap();
    let pipeline = pipeline(&app, &builds, tmp.path());

    let mut record = record(Action::Install, "test", "test-app-1", "1.0.0");
    pipeline.ledger().update(&mut record).await.unwrap();
    pipeline.run(&mut record, false).await.unwrap();

    assert!(record.deleted);
    assert!(app
        .get(DEPLOYMENT_RECORD_ID, GetOptions::default())
        .await
        .unwrap_err()
        .is_not_found());
    assert_eq!(deployed_version(&app).await, "1.0.0");
    assert_eq!(
        app.ids().await,
        vec!["_design/test-app-1", "_design/test-app-1-client"]
    );

    let expected = build_path(tmp.path(), "test-app-api", &bundle);
    let current = layout(tmp.path()).current("test-app-api");
    assert_eq!(current.live_target().await.unwrap(), Some(expected.clone()));
    assert_eq!(
        File::new(expected.join("index.js")).read_string().await.unwrap(),
        "console.log('v1');"
    );
    assert!(File::new(expected.join("lib/util.js")).exists().await);
    assert!(!Lockfile::new(tmp.path().join("stagehand.lock")).exists().unwrap());
}

#[tokio::test]
async fn test_upgrade_only_replaces_changed_apps() {
    let tmp = tempfile::tempdir().unwrap();
    let app = Arc::new(MemoryStore::new("medic"));
    let builds = Arc::new(MemoryStore::new("builds"));
    let api_v1 = tgz(&[("index.js", "// api 1.0.0")]);
    let api_v2 = tgz(&[("index.js", "// api 1.1.0")]);
    let sentinel = tgz(&[("index.js", "// sentinel")]);
    builds
        .put(&build_doc(
            "test:test-app-1:1.0.0",
            &[(API_V1, &api_v1[..]), (SENTINEL, &sentinel[..])],
        ))
        .await
        .unwrap();
    builds
        .put(&build_doc(
            "test:test-app-1:1.1.0",
            &[(API_V2, &api_v2[..]), (SENTINEL, &sentinel[..])],
        ))
        .await
        .unwrap();
    let pipeline = pipeline_with(&app, &builds, tmp.path(), logging_lifecycle(tmp.path()));

    let mut first = record(Action::Install, "test", "test-app-1", "1.0.0");
    pipeline.run(&mut first, false).await.unwrap();
    assert_eq!(
        starts(tmp.path()).await,
        vec!["start test-app-api", "start test-app-sentinel"]
    );

    let mut upgrade = record(Action::Install, "test", "test-app-1", "1.1.0");
    pipeline.run(&mut upgrade, false).await.unwrap();
    assert_eq!(deployed_version(&app).await, "1.1.0");
    assert_eq!(starts(tmp.path()).await.len(), 4);

    let api_dir = layout(tmp.path()).app_dir("test-app-api");
    assert_eq!(
        api_dir.list_dirs().await.unwrap(),
        vec![build_path(tmp.path(), "test-app-api", &api_v2)]
    );
    assert!(!api_dir.link("old").exists().await);
    assert_eq!(
        layout(tmp.path())
            .current("test-app-sentinel")
            .live_target()
            .await
            .unwrap(),
        Some(build_path(tmp.path(), "test-app-sentinel", &sentinel))
    );

    // the same build again changes no app, so nothing is restarted
    let mut again = record(Action::Install, "test", "test-app-1", "1.1.0");
    pipeline.run(&mut again, false).await.unwrap();
    assert_eq!(starts(tmp.path()).await.len(), 4);
}

#[tokio::test]
async fn test_channel_request_installs_latest_release() {
    let tmp = tempfile::tempdir().unwrap();
    let app = Arc::new(MemoryStore::new("medic"));
    let builds = Arc::new(MemoryStore::new("builds"));
    builds.register_view("builds/releases", releases_view()).await;

    let bundle = tgz(&[("index.js", "")]);
    let releases = [("1.0.0", "release"), ("1.1.0", "release"), ("2.0.0-beta.1", "beta")];
    for (version, channel) in releases {
        let id = format!("test:test-app-1:{}", version);
        let mut doc = build_doc(&id, &[(API_V1, &bundle[..])]);
        doc["channels"] = serde_json::json!([channel]);
        builds.put(&doc).await.unwrap();
    }
    let pipeline = pipeline(&app, &builds, tmp.path());

    let mut record = write_request(
        app.as_ref(),
        builds.as_ref(),
        pipeline.ledger(),
        &DeploymentRequest::Install("@test:test-app-1:release".to_string()),
        "medic",
        "medic",
    )
    .await
    .unwrap();
    assert_eq!(record.build_info.key(), "test:test-app-1:1.1.0");

    pipeline.run(&mut record, false).await.unwrap();
    assert_eq!(deployed_version(&app).await, "1.1.0");

    let missing = write_request(
        app.as_ref(),
        builds.as_ref(),
        pipeline.ledger(),
        &DeploymentRequest::Install("@test:test-app-1:nightly".to_string()),
        "medic",
        "medic",
    )
    .await
    .unwrap_err();
    assert!(missing.to_string().contains("no builds for the"), "{}", missing);
}

#[tokio::test]
async fn test_stage_then_complete_from_requests() {
    let tmp = tempfile::tempdir().unwrap();
    let app = Arc::new(MemoryStore::new("medic"));
    let builds = Arc::new(MemoryStore::new("builds"));
    let bundle = tgz(&[("index.js", "// staged")]);
    builds
        .put(&build_doc("test:test-app-1:1.0.0", &[(API_V1, &bundle[..])]))
        .await
        .unwrap();
    let pipeline = pipeline(&app, &builds, tmp.path());

    let stage = DeploymentRequest::Stage("1.0.0".to_string());
    let mut staged = write_request(
        app.as_ref(),
        builds.as_ref(),
        pipeline.ledger(),
        &stage,
        "test",
        "test-app-1",
    )
    .await
    .unwrap();
    pipeline.run(&mut staged, false).await.unwrap();
    assert!(staged.staging_complete);
    assert!(app
        .get("_design/test-app-1", GetOptions::default())
        .await
        .is_err());
    assert!(!layout(tmp.path()).app_dir("test-app-api").exists().await);

    let mut complete = write_request(
        app.as_ref(),
        builds.as_ref(),
        pipeline.ledger(),
        &DeploymentRequest::Complete,
        "test",
        "test-app-1",
    )
    .await
    .unwrap();
    pipeline.run(&mut complete, false).await.unwrap();
    assert_eq!(deployed_version(&app).await, "1.0.0");
    assert!(layout(tmp.path())
        .current("test-app-api")
        .live_target()
        .await
        .unwrap()
        .is_some());
}

fn boot_options(root: &Path) -> AppOptions {
    AppOptions {
        mode: ModeProfile {
            mode: Mode::Local,
            deployments: root.join("deployments"),
            start: sh("true"),
            stop: sh("true"),
            manage_app_lifecycle: true,
        },
        daemon: false,
        couch_url: "http://localhost:5984/medic".to_string(),
        builds_url: "http://localhost:5984/builds".to_string(),
        query_timeout: Duration::from_secs(1),
        storage: StorageOptions::default(),
        warmer: fast_warmer(),
        watcher: watcher::Options::default(),
        request: None,
        max_shutdown_delay: Duration::from_secs(1),
    }
}

#[tokio::test]
async fn test_boot_finishes_pending_deployment_and_restarts_apps() {
    let tmp = tempfile::tempdir().unwrap();
    let app = Arc::new(MemoryStore::new("medic"));
    let builds = Arc::new(MemoryStore::new("builds"));
    let bundle = tgz(&[("index.js", "// boot")]);
    builds
        .put(&build_doc("test:test-app-1:1.0.0", &[(API_V1, &bundle[..])]))
        .await
        .unwrap();
    let pipeline = pipeline_with(&app, &builds, tmp.path(), logging_lifecycle(tmp.path()));
    let options = boot_options(tmp.path());

    boot(&options, app.clone(), &pipeline, Box::pin(pending::<()>()))
        .await
        .unwrap();
    assert!(starts(tmp.path()).await.is_empty());

    let mut installed = record(Action::Install, "test", "test-app-1", "1.0.0");
    pipeline.run(&mut installed, false).await.unwrap();
    assert_eq!(starts(tmp.path()).await.len(), 1);

    // a record left behind by a previous process, for an unchanged build
    let mut pending_record = record(Action::Install, "test", "test-app-1", "1.0.0");
    pipeline.ledger().update(&mut pending_record).await.unwrap();

    boot(&options, app.clone(), &pipeline, Box::pin(pending::<()>()))
        .await
        .unwrap();
    assert_eq!(starts(tmp.path()).await.len(), 2);
    assert!(app
        .get(DEPLOYMENT_RECORD_ID, GetOptions::default())
        .await
        .is_err());
}

#[tokio::test]
async fn test_interrupted_cutover_resumes_at_the_deploy_stage() {
    let tmp = tempfile::tempdir().unwrap();
    let app = Arc::new(MemoryStore::new("medic"));
    let builds = Arc::new(MemoryStore::new("builds"));
    let bundle = tgz(&[("index.js", "// resumed")]);
    builds
        .put(&build_doc("test:test-app-1:1.0.0", &[(API_V1, &bundle[..])]))
        .await
        .unwrap();

    // stopping fails once, then succeeds
    let marker = tmp.path().join("stopped-once");
    let log = tmp.path().join("starts.log");
    let lifecycle = Lifecycle::new(
        sh(&format!("echo start {{{{app}}}} >> {}", log.display())),
        sh(&format!("test -f {0} || {{ touch {0}; exit 1; }}", marker.display())),
    )
    .unwrap();
    let pipeline = pipeline_with(&app, &builds, tmp.path(), lifecycle);

    let mut record = record(Action::Install, "test", "test-app-1", "1.0.0");
    pipeline.ledger().update(&mut record).await.unwrap();
    assert!(pipeline.run(&mut record, false).await.is_err());
    assert!(app
        .get("_design/test-app-1", GetOptions::default())
        .await
        .is_err());
    assert!(starts(tmp.path()).await.is_empty());
    assert!(!Lockfile::new(tmp.path().join("stagehand.lock")).exists().unwrap());
    let downloads = builds.calls(Operation::Get).await;

    let mut resumed = pending_deployment(app.as_ref()).await.unwrap().unwrap();
    assert_eq!(resumed.last_stage_key(), Some(Stage::Deploy.key()));
    pipeline.run(&mut resumed, true).await.unwrap();

    assert_eq!(builds.calls(Operation::Get).await, downloads);
    assert_eq!(deployed_version(&app).await, "1.0.0");
    assert_eq!(starts(tmp.path()).await, vec!["start test-app-api"]);
    assert_eq!(
        layout(tmp.path())
            .current("test-app-api")
            .live_target()
            .await
            .unwrap(),
        Some(build_path(tmp.path(), "test-app-api", &bundle))
    );
    assert!(app
        .get(DEPLOYMENT_RECORD_ID, GetOptions::default())
        .await
        .unwrap_err()
        .is_not_found());
}
