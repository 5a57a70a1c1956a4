//! Program source URI resolution.
//!
//! Program binaries are referenced either by a download URL or by a path
//! that already exists on the node.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ProgramSource {
    /// HTTP(S): https://releases.example.com/xray-linux-64
    Http { url: String },
    /// Path already present on the node: file:///usr/local/bin/xray or /usr/bin/xray
    Local { path: String },
    /// Content-addressed blob served from the program store: sha256:ab12...
    Blob { hash: String },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unsupported source scheme: {0}")]
    UnsupportedScheme(String),
    #[error("invalid source URI: {0}")]
    InvalidUri(String),
}

impl ProgramSource {
    pub fn parse(uri: &str) -> Result<Self, SourceError> {
        if uri.starts_with("https://") || uri.starts_with("http://") {
            Ok(ProgramSource::Http { url: uri.to_string() })
        } else if let Some(path) = uri.strip_prefix("file://") {
            if path.is_empty() {
                return Err(SourceError::InvalidUri(uri.to_string()));
            }
            Ok(ProgramSource::Local { path: path.to_string() })
        } else if let Some(hash) = uri.strip_prefix("sha256:") {
            if hash.len() < 6 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(SourceError::InvalidUri(uri.to_string()));
            }
            Ok(ProgramSource::Blob { hash: hash.to_ascii_lowercase() })
        } else if uri.starts_with('/') {
            Ok(ProgramSource::Local { path: uri.to_string() })
        } else {
            Err(SourceError::UnsupportedScheme(uri.to_string()))
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            ProgramSource::Http { .. } => "http",
            ProgramSource::Local { .. } => "file",
            ProgramSource::Blob { .. } => "sha256",
        }
    }

    /// Download URL for this source, if the node has to fetch it.
    pub fn fetch_url(&self, base_url: &str) -> Option<String> {
        match self {
            ProgramSource::Http { url } => Some(url.clone()),
            ProgramSource::Blob { hash } => {
                Some(format!("{}/programs/{hash}", base_url.trim_end_matches('/')))
            }
            ProgramSource::Local { .. } => None,
        }
    }
}
