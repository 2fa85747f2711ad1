//! Storage layout configuration

use std::path::PathBuf;

use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::filesys::link::Link;
use crate::models::ddoc::App;

/// Name of the link to the live build of an app
pub const CURRENT_LINK: &str = "current";

/// Name of the link to the build replaced by the last swap
pub const OLD_LINK: &str = "old";

/// Per-user storage for stagehand itself
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Get the single-instance lock file path
    pub fn lock_file(&self) -> PathBuf {
        self.base_dir.join("stagehand.lock")
    }

    /// Deployments directory of the `local` mode
    pub fn local_deployments_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("deployments"))
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new(home_dir().join(".stagehand"))
    }
}

/// The user's home directory, or the working directory if unknown
pub fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Where unpacked application builds live:
/// `<root>/<app>/<digest>`, plus the `current` and `old` links per app
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentLayout {
    root: Dir,
}

impl DeploymentLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Dir::new(root),
        }
    }

    pub fn root(&self) -> &Dir {
        &self.root
    }

    pub fn app_dir(&self, name: &str) -> Dir {
        self.root.subdir(name)
    }

    /// Directory holding this exact build of the app
    pub fn deploy_dir(&self, app: &App) -> Dir {
        self.app_dir(&app.name).subdir(&app.digest_dir())
    }

    pub fn current(&self, name: &str) -> Link {
        self.app_dir(name).link(CURRENT_LINK)
    }

    pub fn old(&self, name: &str) -> Link {
        self.app_dir(name).link(OLD_LINK)
    }
}
