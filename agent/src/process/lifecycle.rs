//! Starting and stopping application processes
//!
//! Each app is started and stopped by an external command built from a
//! template in which `{{app}}` is replaced by the app name.

use std::collections::BTreeSet;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::StagehandError;

/// Placeholder replaced by the app name in command templates
pub const APP_PLACEHOLDER: &str = "{{app}}";

#[derive(Debug, Clone)]
pub struct Lifecycle {
    start: Vec<String>,
    stop: Vec<String>,

    /// Apps started and not stopped since, shared between clones
    running: Arc<Mutex<BTreeSet<String>>>,
}

impl Lifecycle {
    pub fn new(start: Vec<String>, stop: Vec<String>) -> Result<Self, StagehandError> {
        if start.is_empty() || stop.is_empty() {
            return Err(StagehandError::Config(
                "start and stop commands must not be empty".to_string(),
            ));
        }
        Ok(Self {
            start,
            stop,
            running: Arc::new(Mutex::new(BTreeSet::new())),
        })
    }

    /// Apps this process started that are still running
    pub fn running(&self) -> Vec<String> {
        match self.running.lock() {
            Ok(running) => running.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    fn mark(&self, app: &str, running: bool) {
        let mut set = match self.running.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        if running {
            set.insert(app.to_string());
        } else {
            set.remove(app);
        }
    }

    fn argv(template: &[String], app: &str) -> Vec<String> {
        template
            .iter()
            .map(|part| part.replace(APP_PLACEHOLDER, app))
            .collect()
    }

    async fn exec(template: &[String], app: &str) -> Result<(), StagehandError> {
        let argv = Self::argv(template, app);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| StagehandError::Process("empty command".to_string()))?;
        debug!("Running {:?}", argv);

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| StagehandError::Process(format!("{}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StagehandError::Process(format!(
                "{} exited with {}: {}",
                argv.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }

    /// Start apps one after another, stopping at the first failure
    pub async fn start(&self, apps: &[String]) -> Result<(), StagehandError> {
        info!("Starting apps {:?}", apps);
        for app in apps {
            Self::exec(&self.start, app).await?;
            self.mark(app, true);
        }
        info!("All apps started");
        Ok(())
    }

    /// Stop all apps at once. Every stop runs to completion; the first
    /// failure is reported afterwards.
    pub async fn stop(&self, apps: &[String]) -> Result<(), StagehandError> {
        info!("Stopping apps {:?}", apps);
        let results = join_all(apps.iter().map(|app| Self::exec(&self.stop, app))).await;
        for (app, result) in apps.iter().zip(&results) {
            match result {
                Ok(()) => self.mark(app, false),
                Err(e) => warn!("Failed to stop {}: {}", app, e),
            }
        }
        results.into_iter().collect::<Result<Vec<_>, _>>()?;
        info!("All apps stopped");
        Ok(())
    }

    /// Fire the stop commands without waiting for them. Used while exiting.
    pub fn stop_sync(&self, apps: &[String]) {
        for app in apps {
            let argv = Self::argv(&self.stop, app);
            if let Some((program, args)) = argv.split_first() {
                let spawned = std::process::Command::new(program)
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn();
                if let Err(e) = spawned {
                    warn!("Failed to stop {}: {}", app, e);
                }
            }
        }
    }
}
