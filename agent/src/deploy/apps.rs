//! Application bundles on disk
//!
//! Every build of an app is unpacked once into `<root>/<app>/<digest>`. The
//! `current` link selects the live build; during a swap the build it replaced
//! stays reachable through `old` until post-deploy cleanup.

use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, info};

use crate::errors::StagehandError;
use crate::filesys::dir::Dir;
use crate::models::ddoc::App;
use crate::storage::layout::DeploymentLayout;
use crate::store::DocStore;

/// Leading directory npm packs every file under
const PACKAGE_DIR: &str = "package";

pub struct AppDeployer {
    layout: DeploymentLayout,
}

impl AppDeployer {
    pub fn new(layout: DeploymentLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &DeploymentLayout {
        &self.layout
    }

    /// An app is changed unless `current` resolves to this exact build
    pub async fn is_changed(&self, app: &App) -> Result<bool, StagehandError> {
        let target = self.layout.current(&app.name).live_target().await?;
        Ok(target.as_deref() != Some(self.layout.deploy_dir(app).path()))
    }

    pub async fn changed_apps(&self, apps: &[App]) -> Result<Vec<App>, StagehandError> {
        let mut changed = Vec::new();
        for app in apps {
            if self.is_changed(app).await? {
                changed.push(app.clone());
            }
        }
        debug!(
            "Changed apps: {:?}",
            changed.iter().map(|a| &a.name).collect::<Vec<_>>()
        );
        Ok(changed)
    }

    /// Unpack the app's bundle from `ddoc_id` unless this build is already on disk
    pub async fn unpack(
        &self,
        store: &dyn DocStore,
        ddoc_id: &str,
        app: &App,
    ) -> Result<(), StagehandError> {
        let target = self.layout.deploy_dir(app);
        if target.exists().await {
            debug!("{} already unpacked at {}", app.name, target.path().display());
            return Ok(());
        }

        let data = store.get_attachment(ddoc_id, &app.attachment_name).await?;
        let dest = target.path().to_path_buf();
        tokio::task::spawn_blocking(move || unpack_tgz(&data, &dest))
            .await
            .map_err(|e| StagehandError::Internal(e.to_string()))??;

        info!("Unpacked {} to {}", app.name, target.path().display());
        Ok(())
    }

    /// Point `current` at the app's new build, keeping the live one as `old`.
    ///
    /// Re-running after an interruption converges: a missing or dangling
    /// `current` is simply created again.
    pub async fn swap(&self, app: &App) -> Result<(), StagehandError> {
        let current = self.layout.current(&app.name);
        let old = self.layout.old(&app.name);
        let next = self.layout.deploy_dir(app);
        self.layout.app_dir(&app.name).create().await?;

        if let Some(live) = current.live_target().await? {
            if live != next.path() {
                old.remove().await?;
                old.point_to(&live).await?;
                debug!("{}: old -> {}", app.name, live.display());
            }
        }

        current.remove().await?;
        current.point_to(next.path()).await?;
        info!("{}: current -> {}", app.name, next.path().display());
        Ok(())
    }

    /// Drop every build of the app except the live one, and the `old` link
    pub async fn prune(&self, name: &str) -> Result<(), StagehandError> {
        let app_dir = self.layout.app_dir(name);
        if !app_dir.exists().await {
            return Ok(());
        }

        let current = self.layout.current(name).target().await?;
        let old = self.layout.old(name);
        if let Some(previous) = old.target().await? {
            if Some(&previous) != current.as_ref() {
                debug!("Deleting old {} from {}", name, previous.display());
                Dir::new(previous).delete().await?;
            }
        }
        old.remove().await?;

        for build in app_dir.list_dirs().await? {
            if Some(&build) != current.as_ref() {
                debug!("Deleting unused {} build {}", name, build.display());
                Dir::new(build).delete().await?;
            }
        }
        Ok(())
    }

    /// Names of the apps that have a live `current` build
    pub async fn installed_apps(&self) -> Result<Vec<String>, StagehandError> {
        let root = self.layout.root();
        if !root.exists().await {
            return Ok(Vec::new());
        }

        let mut apps = Vec::new();
        for dir in root.list_dirs().await? {
            let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if self.layout.current(name).live_target().await?.is_some() {
                apps.push(name.to_string());
            }
        }
        Ok(apps)
    }
}

/// Archive entry path without the leading `package/`, or `None` if it would
/// escape the destination
fn entry_path(path: &Path) -> Option<PathBuf> {
    let relative = path.strip_prefix(PACKAGE_DIR).unwrap_or(path);
    let mut clean = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(clean)
}

/// Unpack a gzipped tarball into `dest`. The archive lands in a sibling
/// directory first so `dest` only ever appears complete.
fn unpack_tgz(data: &[u8], dest: &Path) -> Result<(), StagehandError> {
    let mut partial = dest.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);
    if partial.exists() {
        std::fs::remove_dir_all(&partial)?;
    }
    std::fs::create_dir_all(&partial)?;

    let mut archive = tar::Archive::new(GzDecoder::new(data));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw = entry.path()?.into_owned();
        let relative = entry_path(&raw).ok_or_else(|| {
            StagehandError::Deploy(format!("Refusing to unpack {}", raw.display()))
        })?;
        if relative.as_os_str().is_empty() {
            continue;
        }

        let out = partial.join(&relative);
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&out)?;
    }

    std::fs::rename(&partial, dest)?;
    Ok(())
}
