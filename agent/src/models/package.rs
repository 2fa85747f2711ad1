//! Package descriptors
//!
//! A package is named as `[@]namespace:application:version`, or with the
//! legacy shorthand `[@]version` for the default application. A leading `@`
//! names a release channel instead of an exact version.

use std::fmt;

use serde_json::json;
use tracing::debug;

use crate::errors::StagehandError;
use crate::store::{DocStore, QueryOptions};

/// View of the build repository listing builds by channel
pub const RELEASES_VIEW: &str = "builds/releases";

/// A parsed package descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDescriptor {
    pub namespace: String,
    pub application: String,
    pub version: String,
    pub is_channel: bool,
}

impl PackageDescriptor {
    /// Parse a descriptor, filling the legacy shorthand with the given defaults
    pub fn parse(
        descriptor: &str,
        default_namespace: &str,
        default_application: &str,
    ) -> Result<Self, StagehandError> {
        let (is_channel, rest) = match descriptor.strip_prefix('@') {
            Some(rest) => (true, rest),
            None => (false, descriptor),
        };

        let parts: Vec<&str> = rest.splitn(3, ':').collect();
        let package = match parts.as_slice() {
            [namespace, application, version]
                if !namespace.is_empty() && !application.is_empty() && !version.is_empty() =>
            {
                Self {
                    namespace: namespace.to_string(),
                    application: application.to_string(),
                    version: version.to_string(),
                    is_channel,
                }
            }
            _ => Self {
                namespace: default_namespace.to_string(),
                application: default_application.to_string(),
                version: rest.to_string(),
                is_channel,
            },
        };

        if !package.is_valid() {
            return Err(StagehandError::InvalidRequest(format!(
                "Invalid package descriptor: '{}'",
                descriptor
            )));
        }
        Ok(package)
    }

    pub fn is_valid(&self) -> bool {
        !self.namespace.is_empty() && !self.application.is_empty() && !self.version.is_empty()
    }

    /// Turn a channel into the exact build it currently points at
    pub async fn resolve(self, builds: &dyn DocStore) -> Result<Self, StagehandError> {
        if !self.is_channel {
            return Ok(self);
        }

        debug!("{} is a channel, looking up its latest build", self);
        let rows = builds
            .query(
                RELEASES_VIEW,
                QueryOptions {
                    startkey: Some(json!([self.version, self.namespace, self.application, {}])),
                    endkey: Some(json!([self.version, self.namespace, self.application])),
                    descending: true,
                    limit: Some(1),
                },
            )
            .await?;

        let id = rows
            .first()
            .and_then(|row| row.id.as_deref())
            .ok_or_else(|| {
                StagehandError::InvalidRequest(format!(
                    "There are currently no builds for the '{}' channel",
                    self
                ))
            })?;

        debug!("Found {}", id);
        Self::parse(id, &self.namespace, &self.application)
    }
}

impl fmt::Display for PackageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}:{}:{}",
            if self.is_channel { "@" } else { "" },
            self.namespace,
            self.application,
            self.version
        )
    }
}
