//! Persistent storage for project documents.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  load on hub start   ┌────────────────────────────┐
//! │ ProjectHub  │ ◄──────────────────  │ dyn DocumentStore          │
//! │ (in-memory) │ ──────────────────►  │  ├── MemoryStore (HashMap) │
//! └─────────────┘  save on leave       │  ├── FileStore   ({id}.json)│
//!                                      │  └── RocksStore  (RocksDB)  │
//!                                      └────────────────────────────┘
//! ```
//!
//! The hub only ever sees the trait; each blob is the serialized document
//! keyed by project id. Calls are synchronous and are run on the blocking
//! pool by the caller.

pub mod fs;
pub mod memory;
pub mod rocks;

pub use fs::FileStore;
pub use memory::MemoryStore;
pub use rocks::{ProjectMetadata, RocksStore, StoreConfig};

/// Key → blob persistence keyed by project id.
pub trait DocumentStore: Send + Sync {
    /// Store (or overwrite) the blob for a project.
    fn save(&self, project_id: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Load the blob for a project. Absent projects are [`StoreError::NotFound`].
    fn load(&self, project_id: &str) -> Result<Vec<u8>, StoreError>;

    /// Remove a project's blob. Absent projects are [`StoreError::NotFound`].
    fn delete(&self, project_id: &str) -> Result<(), StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// No blob stored for this project
    NotFound(String),
    /// Project id cannot be used as a storage key
    InvalidKey(String),
    /// RocksDB internal error
    DatabaseError(String),
    /// I/O error
    IoError(String),
    /// Compression error
    CompressionError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "Project not found: {id}"),
            StoreError::InvalidKey(id) => write!(f, "Invalid project key: {id:?}"),
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::IoError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::NotFound("alpha".into());
        assert!(err.to_string().contains("not found"));
        assert!(err.is_not_found());

        let err = StoreError::DatabaseError("test".into());
        assert!(err.to_string().contains("Database error"));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_backends_are_substitutable() {
        let dir = tempfile::tempdir().unwrap();
        let stores: Vec<Arc<dyn DocumentStore>> = vec![
            Arc::new(MemoryStore::new()),
            Arc::new(FileStore::open(dir.path().join("fs")).unwrap()),
            Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("rocks"))).unwrap()),
        ];

        for store in stores {
            assert!(store.load("p").unwrap_err().is_not_found());
            store.save("p", br#"{"x":1}"#).unwrap();
            assert_eq!(store.load("p").unwrap(), br#"{"x":1}"#);
            store.save("p", br#"{"x":2}"#).unwrap();
            assert_eq!(store.load("p").unwrap(), br#"{"x":2}"#);
            store.delete("p").unwrap();
            assert!(store.load("p").unwrap_err().is_not_found());
            assert!(store.delete("p").unwrap_err().is_not_found());
        }
    }
}
