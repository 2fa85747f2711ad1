//! Utility functions

use base64::prelude::{Engine as _, BASE64_STANDARD};
use serde::{Deserialize, Serialize};

/// Version information for stagehand
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Digest of some content in the store's `<algorithm>-<base64>` notation
pub fn content_digest(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256-{}", BASE64_STANDARD.encode(hasher.finalize()))
}

/// Render a progress bar such as `[|||||42%|||||_______________]`
pub fn progress_bar(progress: u32, width: usize) -> String {
    let progress = progress.min(100);
    let label = format!("{}%", progress);
    let filled = (progress as usize * width) / 100;

    let mut bar: Vec<char> = std::iter::repeat('|')
        .take(filled)
        .chain(std::iter::repeat('_').take(width.saturating_sub(filled)))
        .collect();

    // centre the label inside the filled part when it fits
    if filled >= label.len() {
        let start = (filled - label.len()) / 2;
        for (i, c) in label.chars().enumerate() {
            bar[start + i] = c;
        }
    }

    format!("[{}]", bar.into_iter().collect::<String>())
}
