//! Design documents and the applications they carry

use serde::Deserialize;
use serde_json::Value;

use crate::errors::StagehandError;

/// Marker inserted into design document ids that are not yet in production
pub const STAGED_MARKER: &str = ":staged:";

/// First id of the staged range
pub const STAGED_PREFIX: &str = "_design/:staged:";

/// Last id of the staged range
pub const STAGED_RANGE_END: &str = "_design/:staged:\u{fff0}";

/// `_design/x` becomes `_design/:staged:x`
pub fn staged_id(id: &str) -> String {
    match id.strip_prefix("_design/") {
        Some(name) if !name.starts_with(STAGED_MARKER) => format!("{}{}", STAGED_PREFIX, name),
        _ => id.to_string(),
    }
}

/// `_design/:staged:x` becomes `_design/x`
pub fn production_id(id: &str) -> String {
    id.replacen(STAGED_MARKER, "", 1)
}

pub fn is_staged(id: &str) -> bool {
    id.starts_with(STAGED_PREFIX)
}

/// Move a document into the staging namespace, dropping its revision
pub fn stage_doc(doc: &mut Value) {
    if let Some(obj) = doc.as_object_mut() {
        if let Some(id) = obj.get("_id").and_then(Value::as_str).map(staged_id) {
            obj.insert("_id".into(), Value::String(id));
        }
        obj.remove("_rev");
    }
}

/// One deployable application bundled with a build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct App {
    /// Logical name, e.g. `medic-api`
    pub name: String,

    /// Attachment holding the bundle, e.g. `medic-api-0.1.0.tgz`
    pub attachment_name: String,

    /// Content digest of the attachment
    pub digest: String,
}

impl App {
    /// Name the app by its attachment, dropping the trailing `-<version>`
    pub fn from_module(module: &str, digest: impl Into<String>) -> Self {
        let name = match module.rfind('-') {
            Some(pos) => &module[..pos],
            None => module,
        };
        Self {
            name: name.to_string(),
            attachment_name: module.to_string(),
            digest: digest.into(),
        }
    }

    /// Directory name of this build of the app
    pub fn digest_dir(&self) -> String {
        self.digest.replace('/', "")
    }
}

/// Where a build lists its application modules
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleList {
    /// Comma separated `node_modules` at the top of the document
    Legacy(Vec<String>),

    /// `build_info.node_modules` array
    Current(Vec<String>),

    None,
}

#[derive(Deserialize)]
struct ManifestShape {
    #[serde(default)]
    node_modules: Option<String>,

    #[serde(default)]
    build_info: Option<BuildInfoShape>,
}

#[derive(Deserialize)]
struct BuildInfoShape {
    #[serde(default)]
    node_modules: Vec<String>,
}

impl ModuleList {
    pub fn from_doc(doc: &Value) -> Result<Self, StagehandError> {
        let shape: ManifestShape = serde_json::from_value(doc.clone())?;
        if let Some(modules) = shape.node_modules {
            return Ok(ModuleList::Legacy(
                modules
                    .split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(String::from)
                    .collect(),
            ));
        }
        Ok(match shape.build_info {
            Some(info) => ModuleList::Current(info.node_modules),
            None => ModuleList::None,
        })
    }

    pub fn modules(&self) -> &[String] {
        match self {
            ModuleList::Legacy(modules) | ModuleList::Current(modules) => modules,
            ModuleList::None => &[],
        }
    }
}

/// Resolve the apps declared by a build document against its attachments
pub fn declared_apps(doc: &Value) -> Result<Vec<App>, StagehandError> {
    let modules = ModuleList::from_doc(doc)?;
    let attachments = doc.get("_attachments");

    modules
        .modules()
        .iter()
        .map(|module| {
            let digest = attachments
                .and_then(|a| a.get(module))
                .and_then(|a| a.get("digest"))
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    StagehandError::Deploy(format!(
                        "{} was specified in build_info.node_modules but is not attached",
                        module
                    ))
                })?;
            Ok(App::from_module(module, digest))
        })
        .collect()
}

/// The first view worth querying to build a design document's indexes
pub fn representative_view(doc: &Value) -> Option<String> {
    let id = doc.get("_id").and_then(Value::as_str)?;
    let name = id.strip_prefix("_design/")?;
    let views = doc.get("views").and_then(Value::as_object)?;
    let view = views.keys().find(|k| k.as_str() != "lib")?;
    Some(format!("{}/{}", name, view))
}
