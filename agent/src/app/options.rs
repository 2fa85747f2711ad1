//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::deploy::warmer::WarmerOptions;
use crate::errors::StagehandError;
use crate::process::lifecycle::{Lifecycle, APP_PLACEHOLDER};
use crate::storage::layout::{DeploymentLayout, StorageLayout};
use crate::storage::settings::{Mode, Settings};
use crate::workers::watcher;

/// A deployment requested on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentRequest {
    /// Install this package descriptor
    Install(String),

    /// Stage this package descriptor without deploying it
    Stage(String),

    /// Deploy what was staged earlier
    Complete,
}

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// How apps are laid out and run on this host
    pub mode: ModeProfile,

    /// Keep watching for deployments after boot
    pub daemon: bool,

    /// Application database URL
    pub couch_url: String,

    /// Build repository URL
    pub builds_url: String,

    /// Timeout of ordinary store requests
    pub query_timeout: Duration,

    /// Storage configuration
    pub storage: StorageOptions,

    /// View warming options
    pub warmer: WarmerOptions,

    /// Watcher options
    pub watcher: watcher::Options,

    /// Deployment to request before booting
    pub request: Option<DeploymentRequest>,

    /// How long a shutdown waits for the watcher to wind down
    pub max_shutdown_delay: Duration,
}

impl AppOptions {
    /// Resolve the runtime options from the settings file and command line
    pub fn from_settings(
        settings: &Settings,
        storage: StorageOptions,
        daemon: bool,
        request: Option<DeploymentRequest>,
    ) -> Result<Self, StagehandError> {
        let mode = ModeProfile::for_mode(
            settings.mode,
            &storage.layout,
            settings.deployments_dir.clone(),
        )?;

        Ok(Self {
            mode,
            daemon,
            couch_url: settings.couch_url()?.to_string(),
            builds_url: settings.builds_url.clone(),
            query_timeout: Duration::from_secs(settings.query_timeout_secs),
            storage,
            warmer: WarmerOptions {
                first_delay: Duration::from_millis(settings.first_progress_delay_millis),
                interval: Duration::from_secs(settings.progress_interval_secs),
                ..Default::default()
            },
            watcher: watcher::Options {
                default_namespace: settings.default_namespace.clone(),
                default_application: settings.default_application.clone(),
            },
            request,
            max_shutdown_delay: Duration::from_secs(5),
        })
    }

    /// Whether this process starts apps at boot and stops them on exit
    pub fn manages_apps(&self) -> bool {
        self.daemon && self.mode.manage_app_lifecycle
    }
}

/// Storage configuration options
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    /// Storage layout paths
    pub layout: StorageLayout,
}

/// Per-mode deployment directory and app commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeProfile {
    pub mode: Mode,

    /// Absolute root of the unpacked app builds
    pub deployments: PathBuf,

    /// Start command template
    pub start: Vec<String>,

    /// Stop command template
    pub stop: Vec<String>,

    /// Start installed apps at boot and stop them on exit
    pub manage_app_lifecycle: bool,
}

impl ModeProfile {
    pub fn for_mode(
        mode: Mode,
        layout: &StorageLayout,
        deployments_override: Option<PathBuf>,
    ) -> Result<Self, StagehandError> {
        let app = APP_PLACEHOLDER.to_string();
        let (default_dir, start, stop, manage_app_lifecycle) = match mode {
            Mode::Development => {
                let dir = PathBuf::from("./temp/deployments");
                let start = vec![
                    "bin/svc-start".to_string(),
                    "./temp/deployments".to_string(),
                    app.clone(),
                ];
                (dir, start, vec!["bin/svc-stop".to_string(), app], true)
            }
            Mode::Local => {
                let dir = layout.local_deployments_dir().path().to_path_buf();
                let start = vec![
                    "horti-svc-start".to_string(),
                    dir.display().to_string(),
                    app.clone(),
                ];
                (dir, start, vec!["horti-svc-stop".to_string(), app], true)
            }
            Mode::Production => (
                PathBuf::from("/srv/software"),
                vec!["svc-start".to_string(), app.clone()],
                vec!["svc-stop".to_string(), app],
                false,
            ),
        };

        let deployments = std::path::absolute(deployments_override.unwrap_or(default_dir))?;
        Ok(Self {
            mode,
            deployments,
            start,
            stop,
            manage_app_lifecycle,
        })
    }

    pub fn layout(&self) -> DeploymentLayout {
        DeploymentLayout::new(&self.deployments)
    }

    pub fn lifecycle(&self) -> Result<Lifecycle, StagehandError> {
        Lifecycle::new(self.start.clone(), self.stop.clone())
    }
}
