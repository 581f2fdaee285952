//! Object storage for archived events and run artifacts.
//!
//! Event artifacts are create-only: [`ObjectStore::write_json_if_absent`] is
//! the exactly-once primitive and reports an occupied path as
//! [`ObjectStoreError::AlreadyExists`]. Run artifacts (metrics, health,
//! reconciliation) are overwritten with [`ObjectStore::write_json`].

pub mod local;
pub mod s3;

use crate::archive::config::ObjectStoreConfig;
use crate::error::ObjectStoreError;
use serde_json::Value;

pub use local::LocalObjectStore;
pub use s3::S3ObjectStore;

pub trait ObjectStore: Send {
    /// Reference the store would return for `relative_path`, without I/O.
    fn ref_for(&self, relative_path: &str) -> String;

    fn write_json_if_absent(
        &self,
        relative_path: &str,
        document: &Value,
    ) -> Result<String, ObjectStoreError>;

    fn write_json(&self, relative_path: &str, document: &Value) -> Result<String, ObjectStoreError>;
}

pub fn open_store(cfg: &ObjectStoreConfig) -> Result<Box<dyn ObjectStore>, ObjectStoreError> {
    let root = cfg.root.trim();
    if root.starts_with("s3://") {
        return Ok(Box::new(S3ObjectStore::from_config(cfg)?));
    }
    Ok(Box::new(LocalObjectStore::new(root)?))
}

/// Pretty JSON with a trailing newline, the on-disk form of every artifact.
pub(crate) fn render_document(document: &Value) -> Result<Vec<u8>, ObjectStoreError> {
    let mut bytes = serde_json::to_vec_pretty(document)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Joins a store prefix and a relative key with exactly one `/`.
pub(crate) fn join_key(prefix: &str, relative_path: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let relative = relative_path.trim_start_matches('/');
    if prefix.is_empty() {
        relative.to_string()
    } else {
        format!("{prefix}/{relative}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_join_with_single_separator() {
        assert_eq!(join_key("", "a/b.json"), "a/b.json");
        assert_eq!(join_key("/archive/", "/a/b.json"), "archive/a/b.json");
    }

    #[test]
    fn store_kind_follows_root_scheme() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let local = ObjectStoreConfig {
            root: tmp.path().display().to_string(),
            ..ObjectStoreConfig::default()
        };
        let store = open_store(&local).expect("local store");
        assert!(store.ref_for("x.json").ends_with("x.json"));
    }
}
