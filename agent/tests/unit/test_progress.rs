use std::sync::Arc;

use serde_json::json;

use stagehand::deploy::ledger::Ledger;
use stagehand::deploy::warmer::{aggregate_progress, Warmer};
use stagehand::models::deployment::{Action, IndexerProgress, LogEntry};
use stagehand::store::memory::{Fault, MemoryStore, Operation};
use stagehand::store::{ActiveTask, DocStore};

use crate::helpers::{fast_warmer, record};

fn indexer(ddoc: &str, node: &str, pid: &str, progress: u32) -> ActiveTask {
    ActiveTask {
        kind: "indexer".to_string(),
        design_document: Some(ddoc.to_string()),
        node: Some(node.to_string()),
        pid: Some(pid.to_string()),
        progress: Some(progress),
    }
}

fn by_ddoc<'a>(indexers: &'a [IndexerProgress], ddoc: &str) -> &'a IndexerProgress {
    indexers
        .iter()
        .find(|i| i.design_document == ddoc)
        .unwrap()
}

#[test]
fn test_shards_of_one_ddoc_are_averaged() {
    let tasks = vec![
        indexer("_design/:staged:medic", "n1", "<0.1.0>", 10),
        indexer("_design/:staged:medic", "n1", "<0.2.0>", 20),
        indexer("_design/:staged:medic", "n2", "<0.1.0>", 31),
        indexer("_design/:staged:medic-client", "n1", "<0.3.0>", 90),
    ];

    let indexers = aggregate_progress(&[], &tasks);
    assert_eq!(indexers.len(), 2);
    assert_eq!(by_ddoc(&indexers, "_design/:staged:medic").progress, 20);
    assert_eq!(by_ddoc(&indexers, "_design/:staged:medic").tasks.len(), 3);
    assert_eq!(by_ddoc(&indexers, "_design/:staged:medic-client").progress, 90);
}

#[test]
fn test_finished_shards_count_as_done() {
    let first = aggregate_progress(
        &[],
        &[
            indexer("_design/:staged:medic", "n1", "<0.1.0>", 40),
            indexer("_design/:staged:medic", "n1", "<0.2.0>", 60),
            indexer("_design/:staged:sentinel", "n1", "<0.5.0>", 70),
        ],
    );

    // one medic shard and the whole sentinel ddoc are no longer reported
    let second = aggregate_progress(&first, &[indexer("_design/:staged:medic", "n1", "<0.2.0>", 80)]);
    assert_eq!(by_ddoc(&second, "_design/:staged:medic").progress, 90);
    assert_eq!(by_ddoc(&second, "_design/:staged:sentinel").progress, 100);
    assert_eq!(
        second.iter().map(|i| i.design_document.as_str()).collect::<Vec<_>>(),
        vec!["_design/:staged:medic", "_design/:staged:sentinel"]
    );

    let done = aggregate_progress(&second, &[]);
    assert!(done.iter().all(|i| i.progress == 100));
}

#[test]
fn test_non_staged_and_other_tasks_are_ignored() {
    let mut compaction = indexer("_design/:staged:medic", "n1", "<0.9.0>", 5);
    compaction.kind = "database_compaction".to_string();
    let tasks = vec![
        compaction,
        indexer("_design/medic", "n1", "<0.1.0>", 50),
        ActiveTask {
            design_document: None,
            ..indexer("", "n1", "<0.2.0>", 50)
        },
    ];

    assert!(aggregate_progress(&[], &tasks).is_empty());
}

#[tokio::test]
async fn test_warming_waits_for_slow_views() {
    let app = Arc::new(MemoryStore::new("medic"));
    app.put(&json!({"_id": "_design/:staged:medic", "views": {"contacts": {"map": "x"}}}))
        .await
        .unwrap();
    app.put(&json!({"_id": "_design/:staged:medic-client", "views": {"lib": {}, "tasks": {"map": "x"}}}))
        .await
        .unwrap();
    app.push_active_tasks(vec![
        indexer("_design/:staged:medic", "n1", "<0.1.0>", 25),
        indexer("_design/:staged:medic-client", "n1", "<0.2.0>", 75),
    ])
    .await;
    app.push_active_tasks(Vec::new()).await;
    for _ in 0..3 {
        app.inject_fault(Operation::Query, Fault::Timeout).await;
    }
    app.inject_fault(Operation::Query, Fault::Status(500)).await;

    let ledger = Ledger::new(app.clone());
    let mut record = record(Action::Install, "medic", "medic", "1.0.0");
    ledger.update(&mut record).await.unwrap();
    Warmer::new(app.clone(), ledger, fast_warmer())
        .warm(&mut record)
        .await
        .unwrap();

    assert_eq!(app.calls(Operation::Query).await, 6);
    let Some(LogEntry::WarmLog { indexers }) = record.log.last() else {
        panic!("no warm log in {:?}", record.log);
    };
    assert!(indexers.iter().all(|i| i.progress == 100));
}
