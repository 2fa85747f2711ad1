use std::sync::Arc;

use serde_json::json;
use tokio_test::{assert_err, assert_ok};

use stagehand::deploy::ledger::Ledger;
use stagehand::deploy::stager::{Stager, COMPILED_DDOCS};
use stagehand::models::deployment::Action;
use stagehand::store::memory::{Fault, MemoryStore, Operation};
use stagehand::store::{DocStore, GetOptions};

use crate::helpers::{attachment, record};

const PRIMARY: &str = "_design/:staged:test-app-1";
const FIRST: &str = "_design/:staged:test-app-1-a";
const SECOND: &str = "_design/:staged:test-app-1-b";

fn stager(app: &Arc<MemoryStore>) -> Stager {
    let builds = Arc::new(MemoryStore::new("builds"));
    Stager::new(app.clone(), builds, Ledger::new(app.clone()))
}

async fn stage_primary(app: &MemoryStore) {
    let compiled = json!({"docs": [
        {"_id": "_design/test-app-1-a", "views": {"a": {"map": "function() {}"}}},
        {"_id": "_design/test-app-1-b", "views": {"b": {"map": "function() {}"}}}
    ]});
    app.put(&json!({
        "_id": PRIMARY,
        "_attachments": {
            COMPILED_DDOCS: attachment("application/json", compiled.to_string().as_bytes())
        }
    }))
    .await
    .unwrap();
}

async fn rev_of(app: &MemoryStore, id: &str) -> String {
    let doc = app.get(id, GetOptions::default()).await.unwrap();
    doc["_rev"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_timed_out_bulk_write_stores_each_ddoc_once() {
    let app = Arc::new(MemoryStore::new("medic"));
    stage_primary(&app).await;
    let record = record(Action::Install, "test", "test-app-1", "1.0.0");

    // the first document lands before the bulk request times out
    app.inject_fault(Operation::BulkWrite, Fault::TimeoutAfter(1))
        .await;
    let puts_before = app.calls(Operation::Put).await;
    stager(&app).extract_ddocs(&record).await.unwrap();

    assert_eq!(app.ids().await, vec![PRIMARY, FIRST, SECOND]);
    assert_eq!(app.calls(Operation::Put).await - puts_before, 1);
    assert!(rev_of(&app, FIRST).await.starts_with("1-"));
    assert!(rev_of(&app, SECOND).await.starts_with("1-"));

    // running the stage again leaves the secondaries alone
    stager(&app).extract_ddocs(&record).await.unwrap();
    assert!(rev_of(&app, FIRST).await.starts_with("1-"));
    assert!(rev_of(&app, SECOND).await.starts_with("1-"));
}

#[tokio::test]
async fn test_concurrent_write_during_fallback_counts_as_stored() {
    let app = Arc::new(MemoryStore::new("medic"));
    stage_primary(&app).await;
    let record = record(Action::Install, "test", "test-app-1", "1.0.0");

    app.inject_fault(Operation::BulkWrite, Fault::Timeout).await;
    app.inject_fault(Operation::Put, Fault::Conflict).await;
    assert_ok!(stager(&app).extract_ddocs(&record).await);

    assert!(app.ids().await.contains(&SECOND.to_string()));
}

#[tokio::test]
async fn test_pre_cleanup_clears_leftover_staged_docs() {
    let app = Arc::new(MemoryStore::new("medic"));
    stage_primary(&app).await;
    app.put(&json!({"_id": FIRST, "views": {}})).await.unwrap();
    app.put(&json!({"_id": "_design/test-app-1", "views": {}}))
        .await
        .unwrap();

    stager(&app).pre_cleanup().await.unwrap();

    assert_eq!(app.ids().await, vec!["_design/test-app-1"]);
    assert_eq!(app.calls(Operation::ViewCleanup).await, 1);
    assert_eq!(app.calls(Operation::Compact).await, 1);
}

#[tokio::test]
async fn test_bulk_failure_other_than_timeout_fails_the_stage() {
    let app = Arc::new(MemoryStore::new("medic"));
    stage_primary(&app).await;
    let record = record(Action::Install, "test", "test-app-1", "1.0.0");

    app.inject_fault(Operation::BulkWrite, Fault::Status(500))
        .await;
    assert_err!(stager(&app).extract_ddocs(&record).await);
    assert_eq!(app.ids().await, vec![PRIMARY]);
}

#[tokio::test]
async fn test_refused_staged_ddoc_fails_the_stage() {
    let app = Arc::new(MemoryStore::new("medic"));
    stage_primary(&app).await;
    let record = record(Action::Install, "test", "test-app-1", "1.0.0");

    app.inject_fault(Operation::BulkWrite, Fault::Reject(SECOND.to_string()))
        .await;
    let refused = assert_err!(stager(&app).extract_ddocs(&record).await);
    assert!(refused.to_string().contains(SECOND), "{}", refused);
    assert!(refused.to_string().contains("forbidden"), "{}", refused);
    assert!(!app.ids().await.contains(&SECOND.to_string()));

    // conflicts from documents an earlier run stored are not refusals
    assert_ok!(stager(&app).extract_ddocs(&record).await);
    assert_eq!(app.ids().await, vec![PRIMARY, FIRST, SECOND]);
}
