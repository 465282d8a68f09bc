//! `StoragePath` parsing and the canonical paths used by the control layer.

use std::fmt;

/// A validated, slash-separated storage key: `/`-prefixed components of
/// `[a-zA-Z0-9_]+`, no empty components, no trailing slash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoragePath(String);

impl StoragePath {
    pub fn parse(raw: impl Into<String>) -> Result<Self, String> {
        let raw = raw.into();
        if !raw.starts_with('/') {
            return Err(format!("path must start with '/': {raw:?}"));
        }
        if raw.len() > 1 && raw.ends_with('/') {
            return Err(format!("path must not have a trailing slash: {raw:?}"));
        }
        for component in raw.split('/').skip(1) {
            if component.is_empty() {
                return Err(format!("path has an empty component: {raw:?}"));
            }
            if !component.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(format!("invalid path component {component:?} in {raw:?}"));
            }
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical paths for a stream rooted at `/<prefix>`.
pub fn revision_number_path(stream_prefix: &str) -> StoragePath {
    StoragePath::parse(format!("/{stream_prefix}/revision_number")).expect("static path")
}

pub fn change_path(stream_prefix: &str, rev: u64) -> StoragePath {
    StoragePath::parse(format!("/{stream_prefix}/change/{rev}")).expect("static path")
}

pub fn format_version_path() -> StoragePath {
    StoragePath::parse("/format_version").expect("static path")
}

pub fn session_path(caret_id: &str) -> StoragePath {
    StoragePath::parse(format!("/session/{caret_id}")).expect("static path")
}
