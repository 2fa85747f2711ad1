//! Symbolic links

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::StagehandError;

/// A symlink wrapper with path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    path: PathBuf,
}

impl Link {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the link itself exists, dangling or not
    pub async fn exists(&self) -> bool {
        fs::symlink_metadata(&self.path).await.is_ok()
    }

    /// The path the link points at, if it is a link
    pub async fn target(&self) -> Result<Option<PathBuf>, StagehandError> {
        match fs::read_link(&self.path).await {
            Ok(target) => Ok(Some(target)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The link target, only if it still exists on disk
    pub async fn live_target(&self) -> Result<Option<PathBuf>, StagehandError> {
        match self.target().await? {
            Some(target) if fs::metadata(&target).await.is_ok() => Ok(Some(target)),
            _ => Ok(None),
        }
    }

    /// Create the link pointing at `target`
    pub async fn point_to(&self, target: &Path) -> Result<(), StagehandError> {
        #[cfg(unix)]
        fs::symlink(target, &self.path).await?;

        #[cfg(windows)]
        fs::symlink_dir(target, &self.path).await?;

        Ok(())
    }

    /// Remove the link if present; never touches its target
    pub async fn remove(&self) -> Result<(), StagehandError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
