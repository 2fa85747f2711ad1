//! Shared fixtures

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};

use stagehand::deploy::pipeline::{Pipeline, PipelineContext};
use stagehand::deploy::warmer::WarmerOptions;
use stagehand::filesys::lockfile::Lockfile;
use stagehand::models::deployment::{Action, BuildInfo, DeploymentRecord};
use stagehand::process::lifecycle::Lifecycle;
use stagehand::storage::layout::DeploymentLayout;
use stagehand::store::memory::{MapFn, MemoryStore};
use stagehand::store::DocStore;

pub fn sh(script: &str) -> Vec<String> {
    vec!["sh".into(), "-c".into(), script.into()]
}

pub fn fast_warmer() -> WarmerOptions {
    WarmerOptions {
        first_delay: Duration::from_millis(1),
        interval: Duration::from_millis(5),
        probe_retry: Duration::from_millis(5),
    }
}

pub fn record(action: Action, namespace: &str, application: &str, version: &str) -> DeploymentRecord {
    DeploymentRecord::new(
        "admin",
        0,
        action,
        BuildInfo {
            namespace: namespace.into(),
            application: application.into(),
            version: version.into(),
        },
    )
}

/// A gzipped npm-style tarball with every file under `package/`
pub fn tgz(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, body) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("package/{}", path), body.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn attachment(content_type: &str, data: &[u8]) -> Value {
    json!({"content_type": content_type, "data": BASE64_STANDARD.encode(data)})
}

/// A build document bundling the given app tarballs and one secondary
/// design document
pub fn build_doc(id: &str, modules: &[(&str, &[u8])]) -> Value {
    let compiled = json!({"docs": [{
        "_id": "_design/test-app-1-client",
        "views": {"by_type": {"map": "function(doc) { emit(doc.type); }"}}
    }]});
    let mut attachments = serde_json::Map::new();
    for (name, bundle) in modules {
        attachments.insert(name.to_string(), attachment("application/octet-stream", bundle));
    }
    attachments.insert(
        "ddocs/compiled.json".to_string(),
        attachment("application/json", compiled.to_string().as_bytes()),
    );

    json!({
        "_id": id,
        "views": {"lib": {}, "contacts": {"map": "function(doc) { emit(doc._id); }"}},
        "build_info": {"node_modules": modules.iter().map(|(name, _)| *name).collect::<Vec<_>>()},
        "_attachments": attachments,
    })
}

/// Index builds by `[channel, namespace, application, version]`
pub fn releases_view() -> MapFn {
    Arc::new(|doc: &Value| {
        let Some(id) = doc["_id"].as_str() else {
            return Vec::new();
        };
        let parts: Vec<&str> = id.splitn(3, ':').collect();
        let [namespace, application, version] = parts.as_slice() else {
            return Vec::new();
        };
        doc["channels"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .map(|channel| (json!([channel, namespace, application, version]), Value::Null))
            .collect()
    })
}

pub fn pipeline(app: &Arc<MemoryStore>, builds: &Arc<MemoryStore>, root: &Path) -> Pipeline {
    let lifecycle = Lifecycle::new(sh("true"), sh("true")).unwrap();
    pipeline_with(app, builds, root, lifecycle)
}

pub fn pipeline_with(
    app: &Arc<MemoryStore>,
    builds: &Arc<MemoryStore>,
    root: &Path,
    lifecycle: Lifecycle,
) -> Pipeline {
    let app: Arc<dyn DocStore> = app.clone();
    let builds: Arc<dyn DocStore> = builds.clone();
    Pipeline::new(PipelineContext {
        app,
        builds,
        layout: DeploymentLayout::new(root.join("deployments")),
        lifecycle,
        lock: Arc::new(Lockfile::new(root.join("stagehand.lock"))),
        warmer: fast_warmer(),
    })
}
