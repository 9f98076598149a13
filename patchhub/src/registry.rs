//! Registry: maps project ids to running hubs.
//!
//! Each project gets its own hub so that documents and broadcasts are
//! isolated between projects. Hubs are created lazily on first access and
//! remove themselves after their idle window (see [`crate::hub`]).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Utf8Bytes;

use crate::hub::{ConnectionId, HubConfig, HubError, HubHandle, ProjectHub};
use crate::storage::DocumentStore;

/// Shared project id → hub map. Hubs hold a clone to remove themselves on eviction.
pub(crate) type HubMap = Arc<Mutex<HashMap<String, HubHandle>>>;

/// How many times [`HubRegistry::join`] retries against a hub that is being evicted.
const JOIN_ATTEMPTS: usize = 3;

/// A registered connection: its hub, identity and outbound queue.
pub struct Membership {
    pub hub: HubHandle,
    pub id: ConnectionId,
    pub outbound: mpsc::Receiver<Utf8Bytes>,
}

/// Process-wide project registry.
pub struct HubRegistry {
    hubs: HubMap,
    store: Arc<dyn DocumentStore>,
    config: HubConfig,
    /// Distinguishes a hub from its successor under the same project id
    generation: AtomicU64,
}

impl HubRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, config: HubConfig) -> Self {
        Self {
            hubs: Arc::new(Mutex::new(HashMap::new())),
            store,
            config,
            generation: AtomicU64::new(0),
        }
    }

    /// Get or create the hub for a project.
    ///
    /// Lookup and insert happen under one lock, so concurrent first accesses
    /// to the same id share a single hub.
    pub async fn get_or_create(&self, project_id: &str) -> HubHandle {
        let mut hubs = self.hubs.lock().await;
        if let Some(hub) = hubs.get(project_id) {
            if !hub.is_closed() {
                return hub.clone();
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let hub = ProjectHub::spawn(
            project_id,
            generation,
            self.store.clone(),
            self.hubs.clone(),
            self.config.clone(),
        );
        hubs.insert(project_id.to_string(), hub.clone());
        info!("Created new hub for project: {project_id}");
        hub
    }

    /// Register a new connection with the project's hub.
    ///
    /// The returned queue already holds the current document as its first message.
    pub async fn join(&self, project_id: &str) -> Result<Membership, HubError> {
        for _ in 0..JOIN_ATTEMPTS {
            let hub = self.get_or_create(project_id).await;
            let id = ConnectionId::new();
            let (tx, outbound) = mpsc::channel(self.config.outbound_capacity.max(1));
            match hub.register(id, tx).await {
                Ok(()) => return Ok(Membership { hub, id, outbound }),
                Err(HubError::Closed) => {
                    warn!("Hub for project {project_id} closed during join, retrying");
                }
            }
        }
        Err(HubError::Closed)
    }

    /// Number of live hubs.
    pub async fn hub_count(&self) -> usize {
        self.hubs.lock().await.len()
    }

    pub async fn contains(&self, project_id: &str) -> bool {
        self.hubs.lock().await.contains_key(project_id)
    }

    pub async fn project_ids(&self) -> Vec<String> {
        self.hubs.lock().await.keys().cloned().collect()
    }

    /// Save every live hub's document. Returns the number of successful saves.
    pub async fn persist_all(&self) -> usize {
        // Collect handles first; hubs lock the map while evicting
        let hubs: Vec<HubHandle> = self.hubs.lock().await.values().cloned().collect();
        let mut saved = 0;
        for hub in hubs {
            match hub.persist().await {
                Ok(true) => saved += 1,
                Ok(false) => warn!("Failed to persist project {}", hub.project_id()),
                Err(HubError::Closed) => {}
            }
        }
        saved
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }
}
