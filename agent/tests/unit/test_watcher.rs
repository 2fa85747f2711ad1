use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::oneshot;
use tokio_test::assert_ok;

use stagehand::models::deployment::{Action, DEPLOYMENT_RECORD_ID, LEGACY_RECORD_ID};
use stagehand::store::memory::MemoryStore;
use stagehand::store::{DocStore, GetOptions};
use stagehand::workers::watcher;

use crate::helpers::{build_doc, pipeline, record, tgz};

async fn wait_for_record_removal(app: &MemoryStore) {
    for _ in 0..500 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let deployed = app.get("_design/test-app-1", GetOptions::default()).await.is_ok();
        let gone = app
            .get(DEPLOYMENT_RECORD_ID, GetOptions::default())
            .await
            .is_err();
        if deployed && gone {
            return;
        }
    }
    panic!("deployment never finished");
}

#[tokio::test]
async fn test_watcher_deploys_written_requests() {
    let tmp = tempfile::tempdir().unwrap();
    let app = Arc::new(MemoryStore::new("medic"));
    let builds = Arc::new(MemoryStore::new("builds"));
    builds
        .put(&build_doc(
            "test:test-app-1:1.0.0",
            &[("test-app-api-1.0.0.tgz", &tgz(&[("index.js", "")])[..])],
        ))
        .await
        .unwrap();
    let pipeline = pipeline(&app, &builds, tmp.path());
    let options = watcher::Options::default();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let watching = watcher::run(
        &options,
        app.clone(),
        &pipeline,
        Box::pin(async move {
            let _ = stop_rx.await;
        }),
    );
    let driving = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut request = record(Action::Install, "test", "test-app-1", "1.0.0");
        pipeline.ledger().update(&mut request).await.unwrap();
        wait_for_record_removal(&app).await;
        let _ = stop_tx.send(());
    };

    let (watched, ()) = tokio::join!(watching, driving);
    assert_ok!(watched);
}

#[tokio::test]
async fn test_watcher_converts_legacy_requests() {
    let tmp = tempfile::tempdir().unwrap();
    let app = Arc::new(MemoryStore::new("medic"));
    let builds = Arc::new(MemoryStore::new("builds"));
    builds
        .put(&build_doc(
            "test:test-app-1:2.0.0",
            &[("test-app-api-2.0.0.tgz", &tgz(&[("index.js", "")])[..])],
        ))
        .await
        .unwrap();
    let pipeline = pipeline(&app, &builds, tmp.path());
    let options = watcher::Options {
        default_namespace: "test".to_string(),
        default_application: "test-app-1".to_string(),
    };
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let watching = watcher::run(
        &options,
        app.clone(),
        &pipeline,
        Box::pin(async move {
            let _ = stop_rx.await;
        }),
    );
    let driving = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        app.put(&json!({
            "_id": LEGACY_RECORD_ID,
            "deploy_info": {"user": "admin", "timestamp": 1496311200000i64, "version": "2.0.0"}
        }))
        .await
        .unwrap();
        wait_for_record_removal(&app).await;
        let _ = stop_tx.send(());
    };

    let (watched, ()) = tokio::join!(watching, driving);
    assert_ok!(watched);

    let primary = app
        .get("_design/test-app-1", GetOptions::default())
        .await
        .unwrap();
    assert_eq!(primary["deploy_info"]["version"], "2.0.0");
    assert_eq!(primary["deploy_info"]["user"], "admin");
    assert!(app.get(LEGACY_RECORD_ID, GetOptions::default()).await.is_err());
}

#[tokio::test]
async fn test_watcher_stops_on_shutdown_when_idle() {
    let tmp = tempfile::tempdir().unwrap();
    let app = Arc::new(MemoryStore::new("medic"));
    let builds = Arc::new(MemoryStore::new("builds"));
    let pipeline = pipeline(&app, &builds, tmp.path());

    let finished = tokio::time::timeout(
        Duration::from_secs(5),
        watcher::run(
            &watcher::Options::default(),
            app.clone(),
            &pipeline,
            Box::pin(tokio::time::sleep(Duration::from_millis(20))),
        ),
    )
    .await;

    assert_ok!(assert_ok!(finished));
    assert!(app.ids().await.is_empty());
}
