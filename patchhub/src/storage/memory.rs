//! In-memory document store for tests and ephemeral servers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{DocumentStore, StoreError};

/// `HashMap`-backed store. Contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of projects currently stored.
    pub fn len(&self) -> usize {
        self.blobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs().is_empty()
    }

    // A poisoned map is still a valid map.
    fn blobs(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DocumentStore for MemoryStore {
    fn save(&self, project_id: &str, data: &[u8]) -> Result<(), StoreError> {
        self.blobs().insert(project_id.to_string(), data.to_vec());
        Ok(())
    }

    fn load(&self, project_id: &str) -> Result<Vec<u8>, StoreError> {
        self.blobs()
            .get(project_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(project_id.to_string()))
    }

    fn delete(&self, project_id: &str) -> Result<(), StoreError> {
        self.blobs()
            .remove(project_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(project_id.to_string()))
    }
}
