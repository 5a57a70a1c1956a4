//! Shared types used across RelayGrid crates.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type NodeId = u64;
pub type RuleId = u64;
pub type TunnelId = u64;
pub type BindingId = u64;
pub type ProfileId = u64;
pub type PlanId = u64;
pub type PeriodId = u64;

/// Default mode for files installed on a node (`rwxr--r--`).
pub const DEFAULT_FILE_MODE: u32 = 0o744;

/// A file the node agent must place on disk before starting the runtime.
///
/// Exactly one of `url` (download) or `content` (inline) is set; an entry with
/// neither refers to a file that already exists on the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub dest: String,
    pub url: Option<String>,
    pub content: Option<String>,
    /// Expected sha256 of the downloaded or inline content.
    pub hash: Option<String>,
    pub mode: u32,
}

impl FileSpec {
    pub fn download(dest: impl Into<String>, url: impl Into<String>, hash: &str) -> Self {
        Self {
            dest: dest.into(),
            url: Some(url.into()),
            content: None,
            hash: Some(hash.to_string()),
            mode: DEFAULT_FILE_MODE,
        }
    }

    pub fn inline(dest: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            dest: dest.into(),
            url: None,
            hash: Some(sha256_hex(content.as_bytes())),
            content: Some(content),
            mode: DEFAULT_FILE_MODE,
        }
    }

    /// Whether the node has to do anything to materialize this file.
    pub fn needs_transfer(&self) -> bool {
        self.url.is_some() || self.content.is_some()
    }
}

/// Lowercase hex sha256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Six-character prefix used to version installed file names.
pub fn short_hash(hash: &str) -> &str {
    &hash[..hash.len().min(6)]
}

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
