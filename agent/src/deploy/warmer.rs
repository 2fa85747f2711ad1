//! View warming
//!
//! Staged design documents are indexed before they replace production ones.
//! Each staged design document gets one view queried until it answers; the
//! store builds all views of a design document at once, so a single answer
//! means the whole document is indexed. Meanwhile the store's indexer tasks
//! are polled and their progress written into the deployment record.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::deploy::ledger::Ledger;
use crate::errors::StagehandError;
use crate::models::ddoc::{representative_view, STAGED_MARKER, STAGED_PREFIX, STAGED_RANGE_END};
use crate::models::deployment::{DeploymentRecord, IndexerProgress, LogEntry};
use crate::store::{ActiveTask, AllDocsOptions, DocStore, QueryOptions};
use crate::utils::progress_bar;

const INDEXER_TASK: &str = "indexer";

#[derive(Debug, Clone)]
pub struct WarmerOptions {
    /// Delay before the first progress poll
    pub first_delay: Duration,

    /// Interval between progress polls
    pub interval: Duration,

    /// Pause before re-querying a view that failed for a reason other than a timeout
    pub probe_retry: Duration,
}

impl Default for WarmerOptions {
    fn default() -> Self {
        Self {
            first_delay: Duration::from_secs(1),
            interval: Duration::from_secs(10),
            probe_retry: Duration::from_secs(1),
        }
    }
}

/// Merge a poll of the store's tasks into the previous progress.
///
/// Tasks that are no longer reported have finished, so everything known
/// starts at 100 before the current tasks are applied.
pub fn aggregate_progress(
    previous: &[IndexerProgress],
    tasks: &[ActiveTask],
) -> Vec<IndexerProgress> {
    let mut indexers: Vec<IndexerProgress> = previous
        .iter()
        .cloned()
        .map(|mut indexer| {
            indexer.tasks.values_mut().for_each(|p| *p = 100);
            indexer
        })
        .collect();

    let staged_indexers = tasks.iter().filter(|task| {
        task.kind == INDEXER_TASK
            && task
                .design_document
                .as_deref()
                .is_some_and(|ddoc| ddoc.contains(STAGED_MARKER))
    });

    for task in staged_indexers {
        let Some(ddoc) = task.design_document.as_deref() else {
            continue;
        };
        let key = format!(
            "{}-{}",
            task.node.as_deref().unwrap_or_default(),
            task.pid.as_deref().unwrap_or_default()
        );

        let position = match indexers.iter().position(|i| i.design_document == ddoc) {
            Some(position) => position,
            None => {
                indexers.push(IndexerProgress {
                    design_document: ddoc.to_string(),
                    progress: 0,
                    tasks: Default::default(),
                });
                indexers.len() - 1
            }
        };
        indexers[position]
            .tasks
            .insert(key, task.progress.unwrap_or(0));
    }

    for indexer in indexers.iter_mut() {
        if !indexer.tasks.is_empty() {
            let sum: u32 = indexer.tasks.values().sum();
            indexer.progress = (sum as f64 / indexer.tasks.len() as f64).round() as u32;
        }
    }

    indexers
}

pub struct Warmer {
    app: Arc<dyn DocStore>,
    ledger: Ledger,
    options: WarmerOptions,
}

impl Warmer {
    pub fn new(app: Arc<dyn DocStore>, ledger: Ledger, options: WarmerOptions) -> Self {
        Self { app, ledger, options }
    }

    /// Index every staged design document, reporting progress in `record`
    pub async fn warm(&self, record: &mut DeploymentRecord) -> Result<(), StagehandError> {
        self.start_warm_log(record).await?;
        let views = self.staged_views().await?;
        info!("Warming {} staged view(s)", views.len());

        {
            let (stop_tx, stop_rx) = watch::channel(false);
            let probe = self.probe_views(&views);
            let progress = self.track_progress(record, stop_rx);
            tokio::pin!(probe);
            tokio::pin!(progress);

            tokio::select! {
                result = &mut progress => result?,
                () = &mut probe => {
                    // let an in-flight progress write land before the final one
                    stop_tx.send_replace(true);
                    progress.await?;
                }
            }
        }

        self.update_indexers(record, &[]).await?;
        info!("Warming complete");
        Ok(())
    }

    /// Append an empty warm log, unless an interrupted run left one last
    async fn start_warm_log(&self, record: &mut DeploymentRecord) -> Result<(), StagehandError> {
        if matches!(record.log.last(), Some(LogEntry::WarmLog { .. })) {
            return Ok(());
        }
        record.log.push(LogEntry::WarmLog {
            indexers: Vec::new(),
        });
        self.ledger.update(record).await
    }

    async fn staged_views(&self) -> Result<Vec<String>, StagehandError> {
        let rows = self
            .app
            .all_docs(AllDocsOptions {
                startkey: Some(STAGED_PREFIX.to_string()),
                endkey: Some(STAGED_RANGE_END.to_string()),
                include_docs: true,
                ..Default::default()
            })
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| row.doc.as_ref())
            .filter_map(representative_view)
            .collect())
    }

    async fn probe_views(&self, views: &[String]) {
        join_all(views.iter().map(|view| self.probe(view))).await;
    }

    /// Query `view` until it answers. Failures are expected while the store
    /// indexes and are never fatal.
    async fn probe(&self, view: &str) {
        let options = QueryOptions {
            limit: Some(1),
            ..Default::default()
        };
        loop {
            match self.app.query(view, options.clone()).await {
                Ok(_) => {
                    debug!("{} is indexed", view);
                    return;
                }
                Err(e) if e.is_timeout() => debug!("{} still indexing", view),
                Err(e) => {
                    info!("Querying {} failed, retrying: {}", view, e);
                    tokio::time::sleep(self.options.probe_retry).await;
                }
            }
        }
    }

    /// Poll indexer tasks until told to stop. Any error ends warming.
    async fn track_progress(
        &self,
        record: &mut DeploymentRecord,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), StagehandError> {
        let mut delay = self.options.first_delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.changed() => return Ok(()),
            }
            if *stop.borrow() {
                return Ok(());
            }

            let tasks = self.app.active_tasks().await?;
            self.update_indexers(record, &tasks).await?;
            delay = self.options.interval;
        }
    }

    async fn update_indexers(
        &self,
        record: &mut DeploymentRecord,
        tasks: &[ActiveTask],
    ) -> Result<(), StagehandError> {
        if !matches!(record.log.last(), Some(LogEntry::WarmLog { .. })) {
            record.log.push(LogEntry::WarmLog {
                indexers: Vec::new(),
            });
        }
        if let Some(LogEntry::WarmLog { indexers }) = record.log.last_mut() {
            *indexers = aggregate_progress(indexers, tasks);
            for indexer in indexers.iter() {
                debug!(
                    "{:<40} {}",
                    indexer.design_document,
                    progress_bar(indexer.progress, 40)
                );
            }
        }
        self.ledger.update(record).await
    }
}
