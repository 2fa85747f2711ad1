//! Settings file management

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::StagehandError;
use crate::logs::LogLevel;

/// How the host runs its applications
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Working copy checkout, apps started with `bin/svc-*`
    Development,

    /// Per-user install under the home directory
    Local,

    /// Appliance install managed by the system supervisor
    #[default]
    #[serde(alias = "medic_os")]
    Production,
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Mode::Development),
            "local" => Ok(Mode::Local),
            "production" | "medic_os" => Ok(Mode::Production),
            _ => Err(format!("Invalid mode: {}", s)),
        }
    }
}

/// Stagehand settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Directory for a daily-rolling log file
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Application database URL, credentials included
    #[serde(default)]
    pub couch_url: Option<String>,

    /// Build repository URL
    #[serde(default = "default_builds_url")]
    pub builds_url: String,

    /// Host mode
    #[serde(default)]
    pub mode: Mode,

    /// Override of the mode's deployments directory
    #[serde(default)]
    pub deployments_dir: Option<PathBuf>,

    /// Namespace assumed by the short `<version>` descriptor
    #[serde(default = "default_namespace")]
    pub default_namespace: String,

    /// Application assumed by the short `<version>` descriptor
    #[serde(default = "default_application")]
    pub default_application: String,

    /// Timeout of ordinary store requests, view probes included
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,

    /// Interval between indexing progress polls
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: u64,

    /// Delay before the first indexing progress poll
    #[serde(default = "default_first_progress_delay")]
    pub first_progress_delay_millis: u64,
}

fn default_builds_url() -> String {
    "https://staging.dev.medicmobile.org/_couch/builds".to_string()
}

fn default_namespace() -> String {
    "medic".to_string()
}

fn default_application() -> String {
    "medic".to_string()
}

fn default_query_timeout() -> u64 {
    60
}

fn default_progress_interval() -> u64 {
    10
}

fn default_first_progress_delay() -> u64 {
    1000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            couch_url: None,
            builds_url: default_builds_url(),
            mode: Mode::default(),
            deployments_dir: None,
            default_namespace: default_namespace(),
            default_application: default_application(),
            query_timeout_secs: default_query_timeout(),
            progress_interval_secs: default_progress_interval(),
            first_progress_delay_millis: default_first_progress_delay(),
        }
    }
}

impl Settings {
    /// Apply `COUCH_URL` and `STAGEHAND_BUILDS_URL` from the environment
    pub fn with_env(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = var("COUCH_URL").filter(|u| !u.is_empty()) {
            self.couch_url = Some(url);
        }
        if let Some(url) = var("STAGEHAND_BUILDS_URL").filter(|u| !u.is_empty()) {
            self.builds_url = url;
        }
        self
    }

    pub fn couch_url(&self) -> Result<&str, StagehandError> {
        self.couch_url
            .as_deref()
            .ok_or_else(|| StagehandError::Config("COUCH_URL is not set".to_string()))
    }
}
