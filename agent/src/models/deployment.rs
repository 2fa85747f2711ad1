//! Deployment record models

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::StagehandError;
use crate::models::package::PackageDescriptor;

/// Well-known id of the deployment record
pub const DEPLOYMENT_RECORD_ID: &str = "horti-upgrade";

/// Id under which older releases requested a deployment
pub const LEGACY_RECORD_ID: &str = "_design/medic:staged";

/// Newest record schema this build understands
pub const SCHEMA_VERSION: u32 = 1;

/// What a deployment record asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Full installation, from download to cutover
    Install,

    /// Everything up to (not including) cutover; ends with `staging_complete`
    Stage,

    /// Cutover of a previously staged installation
    Complete,
}

/// Coordinates of the requested build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub namespace: String,
    pub application: String,
    pub version: String,
}

impl BuildInfo {
    /// Key of the artifact in the build repository
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.namespace, self.application, self.version)
    }
}

impl From<PackageDescriptor> for BuildInfo {
    fn from(package: PackageDescriptor) -> Self {
        Self {
            namespace: package.namespace,
            application: package.application,
            version: package.version,
        }
    }
}

/// Aggregated indexing progress of one design document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerProgress {
    pub design_document: String,

    #[serde(default)]
    pub progress: u32,

    /// Per shard/node task progress, keyed by `<node>-<pid>`
    #[serde(default)]
    pub tasks: BTreeMap<String, u32>,
}

/// One entry of the deployment log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
    /// A pipeline stage was reached
    Stage {
        key: String,
        message: String,
        datetime: i64,
    },

    /// Live view indexing progress, rewritten in place while warming
    WarmLog {
        #[serde(default)]
        indexers: Vec<IndexerProgress>,
    },
}

impl LogEntry {
    pub fn stage_key(&self) -> Option<&str> {
        match self {
            LogEntry::Stage { key, .. } => Some(key),
            LogEntry::WarmLog { .. } => None,
        }
    }
}

/// Epoch milliseconds, or a date string as written by older releases
pub fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .or_else(|_| chrono::DateTime::parse_from_rfc2822(s))
            .ok()
            .map(|dt| dt.timestamp_millis()),
        _ => None,
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(parse_timestamp))
}

/// The persisted record driving a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,

    #[serde(default)]
    pub user: String,

    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created: Option<i64>,

    /// Records written without an action are full installs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub staging_complete: bool,

    pub build_info: BuildInfo,

    #[serde(default)]
    pub log: Vec<LogEntry>,

    #[serde(rename = "_deleted", default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,

    /// Fields written by other tools, preserved across updates
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeploymentRecord {
    /// A fresh record requesting `action` on `build_info`
    pub fn new(user: impl Into<String>, created: i64, action: Action, build_info: BuildInfo) -> Self {
        Self {
            id: DEPLOYMENT_RECORD_ID.to_string(),
            rev: None,
            schema_version: Some(SCHEMA_VERSION),
            user: user.into(),
            created: Some(created),
            action: Some(action),
            staging_complete: false,
            build_info,
            log: Vec::new(),
            deleted: false,
            extra: Map::new(),
        }
    }

    pub fn from_value(value: Value) -> Result<Self, StagehandError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> Result<Value, StagehandError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn action(&self) -> Action {
        self.action.unwrap_or(Action::Install)
    }

    /// Whether this record asks for work that has not been done yet.
    ///
    /// A `stage` request whose staging already completed stays in place until
    /// it is completed, and must not be staged again on every restart.
    pub fn is_actionable(&self) -> bool {
        self.id == DEPLOYMENT_RECORD_ID
            && !self.deleted
            && !(self.action() == Action::Stage && self.staging_complete)
    }

    pub fn check_schema(&self) -> Result<(), StagehandError> {
        match self.schema_version {
            None | Some(SCHEMA_VERSION) => Ok(()),
            Some(other) => Err(StagehandError::Validation(format!(
                "Cannot handle deployment record schema_version {}",
                other
            ))),
        }
    }

    /// Key of the most recently recorded stage, ignoring non-stage entries
    pub fn last_stage_key(&self) -> Option<&str> {
        self.log.iter().rev().find_map(LogEntry::stage_key)
    }

    pub fn has_stage(&self, key: &str) -> bool {
        self.log.iter().any(|entry| entry.stage_key() == Some(key))
    }

    /// Primary design document id of the requested application
    pub fn main_ddoc_id(&self) -> String {
        format!("_design/{}", self.build_info.application)
    }
}
