//! Artifact fingerprinting and key-prefix helpers.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Hex-encoded SHA-256 digest of the file at `path`.
///
/// The whole file is read; an unreadable or missing file is an I/O error.
pub fn fingerprint(path: impl AsRef<Path>) -> io::Result<String> {
    let bytes = fs::read(path.as_ref())?;
    Ok(fingerprint_bytes(&bytes))
}

/// Hex-encoded SHA-256 digest of `bytes`.
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Strip one trailing `/` from `s`.
pub fn rstrip_slash(s: &str) -> &str {
    s.strip_suffix('/').unwrap_or(s)
}

/// Object glob covering everything under `prefix`.
///
/// `Some("images/")` gives `images/*`; `None` or an empty prefix gives `*`.
pub fn path_glob(prefix: Option<&str>) -> String {
    match prefix {
        Some(p) if !p.is_empty() => format!("{}/*", rstrip_slash(p)),
        _ => "*".to_string(),
    }
}

/// A packaged deployable bundle and its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRef {
    path: PathBuf,
    content_hash: String,
}

impl ArtifactRef {
    /// Fingerprint the bundle at `path`.
    pub fn from_path(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let content_hash = fingerprint(&path)?;
        Ok(Self { path, content_hash })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Object key the bundle is published under.
    pub fn deploy_key(&self) -> String {
        format!("{}.zip", self.content_hash)
    }
}
