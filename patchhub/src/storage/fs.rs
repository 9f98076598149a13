//! Filesystem document store: one `{base}/{project_id}.json` file per project.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{DocumentStore, StoreError};

/// Directory-backed store.
///
/// Writes go to a sibling `.tmp` file that is renamed over the target, so a
/// crash mid-write leaves the previous version intact.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    /// Open the store, creating the base directory if it does not exist.
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    pub fn path(&self) -> &Path {
        &self.base_path
    }

    /// Map a project id to its file, refusing ids that would escape the base directory.
    fn file_path(&self, project_id: &str) -> Result<PathBuf, StoreError> {
        let invalid = project_id.is_empty()
            || project_id == "."
            || project_id == ".."
            || project_id.contains(['/', '\\', '\0']);
        if invalid {
            return Err(StoreError::InvalidKey(project_id.to_string()));
        }
        Ok(self.base_path.join(format!("{project_id}.json")))
    }
}

impl DocumentStore for FileStore {
    fn save(&self, project_id: &str, data: &[u8]) -> Result<(), StoreError> {
        let path = self.file_path(project_id)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load(&self, project_id: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.file_path(project_id)?;
        fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StoreError::NotFound(project_id.to_string()),
            _ => e.into(),
        })
    }

    fn delete(&self, project_id: &str) -> Result<(), StoreError> {
        let path = self.file_path(project_id)?;
        fs::remove_file(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StoreError::NotFound(project_id.to_string()),
            _ => e.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_directory() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("nested").join("data");
        let store = FileStore::open(&base).unwrap();
        assert!(store.path().is_dir());
    }

    #[test]
    fn test_file_layout() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.save("alpha", b"{}").unwrap();
        let file = dir.path().join("alpha.json");
        assert!(file.is_file());
        assert_eq!(fs::read(&file).unwrap(), b"{}");
        // No temp file left behind
        assert!(!dir.path().join("alpha.json.tmp").exists());
    }

    #[test]
    fn test_load_existing_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("legacy.json"), br#"{"kept":true}"#).unwrap();

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.load("legacy").unwrap(), br#"{"kept":true}"#);
    }

    #[test]
    fn test_rejects_path_traversal() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        for key in ["", ".", "..", "../escape", "a/b", "a\\b", "nul\0"] {
            assert!(
                matches!(store.save(key, b"{}"), Err(StoreError::InvalidKey(_))),
                "key {key:?} should be rejected"
            );
        }
    }
}
