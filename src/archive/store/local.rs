use crate::archive::store::{ObjectStore, render_document};
use crate::error::ObjectStoreError;
use serde_json::Value;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Filesystem store. Writes land in a temp file in the target directory and
/// are then linked into place, so readers never see a partial document.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, ObjectStoreError> {
        let root = root.as_ref();
        let absolute = std::path::absolute(root).map_err(|source| ObjectStoreError::Io {
            reference: root.display().to_string(),
            source,
        })?;
        Ok(Self { root: absolute })
    }

    fn path_for(&self, relative_path: &str) -> PathBuf {
        self.root.join(relative_path.trim_start_matches('/'))
    }

    fn staged(&self, target: &Path, document: &Value) -> Result<NamedTempFile, ObjectStoreError> {
        let reference = target.display().to_string();
        let io_err = |source: io::Error| ObjectStoreError::Io {
            reference: reference.clone(),
            source,
        };
        let parent = target.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent).map_err(io_err)?;
        let bytes = render_document(document)?;
        let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
        tmp.write_all(&bytes).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        Ok(tmp)
    }
}

impl ObjectStore for LocalObjectStore {
    fn ref_for(&self, relative_path: &str) -> String {
        self.path_for(relative_path).display().to_string()
    }

    fn write_json_if_absent(
        &self,
        relative_path: &str,
        document: &Value,
    ) -> Result<String, ObjectStoreError> {
        let target = self.path_for(relative_path);
        let reference = target.display().to_string();
        if target.exists() {
            return Err(ObjectStoreError::AlreadyExists { reference });
        }
        let tmp = self.staged(&target, document)?;
        match tmp.persist_noclobber(&target) {
            Ok(_) => Ok(reference),
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
                Err(ObjectStoreError::AlreadyExists { reference })
            }
            Err(err) => Err(ObjectStoreError::Io {
                reference,
                source: err.error,
            }),
        }
    }

    fn write_json(&self, relative_path: &str, document: &Value) -> Result<String, ObjectStoreError> {
        let target = self.path_for(relative_path);
        let reference = target.display().to_string();
        let tmp = self.staged(&target, document)?;
        tmp.persist(&target).map_err(|err| ObjectStoreError::Io {
            reference: reference.clone(),
            source: err.error,
        })?;
        Ok(reference)
    }
}
