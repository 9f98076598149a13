//! Per-project coordination loop.
//!
//! ```text
//!  reader pumps ──┐                          ┌──► outbound queue (conn 1) ──► writer pump
//!  registry     ──┼──► mailbox ──► ProjectHub├──► outbound queue (conn 2) ──► writer pump
//!  server       ──┘   (bounded)   (one task) └──► outbound queue (conn N) ──► writer pump
//!                                     │
//!                                     └── save/load ──► dyn DocumentStore (blocking pool)
//! ```
//!
//! The hub task is the only owner of the project's document and membership
//! set. Every read or write of either goes through the mailbox, so commands
//! are applied strictly in arrival order and no locks guard the document.
//!
//! Fan-out never waits on a client: a member whose outbound queue is full is
//! removed on the spot (backpressure drop). All removals, whatever the
//! reason, go through [`ProjectHub::remove_member`], which closes the queue
//! and saves the document exactly once.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Bytes, Utf8Bytes};
use uuid::Uuid;

use crate::protocol::{self, Document};
use crate::registry::HubMap;
use crate::storage::DocumentStore;

/// Unique identifier for one connection, independent of membership size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 8 hex digits are plenty for log correlation
        let simple = self.0.simple().to_string();
        write!(f, "conn-{}", &simple[..8])
    }
}

/// Hub lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    /// No members, document held in memory
    Idle,
    /// At least one member
    Active,
    /// No members, eviction timer armed
    IdlePendingEviction,
    /// Removed from the registry; the task has stopped
    Evicted,
}

/// Why a member left the hub. Used for logging and stats only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Reader pump ended (client closed or transport failed)
    Disconnected,
    /// Outbound queue was full
    Backpressure,
    /// Writer pump already ended and dropped its queue
    WriterClosed,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalReason::Disconnected => write!(f, "disconnected"),
            RemovalReason::Backpressure => write!(f, "dropped: outbound queue full"),
            RemovalReason::WriterClosed => write!(f, "dropped: writer closed"),
        }
    }
}

/// Hub tuning.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Messages buffered per connection before it is dropped as a slow consumer
    pub outbound_capacity: usize,
    /// Commands buffered in the hub mailbox
    pub mailbox_capacity: usize,
    /// How long an empty hub lingers before eviction (None = never evicted)
    pub idle_eviction: Option<Duration>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            mailbox_capacity: 1024,
            idle_eviction: Some(Duration::from_secs(30)),
        }
    }
}

/// Counters for one hub, read through the mailbox.
#[derive(Debug, Clone, PartialEq)]
pub struct HubStats {
    pub project_id: String,
    pub state: HubState,
    pub connections: usize,
    pub patches_applied: u64,
    pub patches_rejected: u64,
    pub invalid_messages: u64,
    pub backpressure_drops: u64,
    pub saves: u64,
    pub save_failures: u64,
}

/// Hub errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubError {
    /// The hub stopped (evicted) before handling the command
    Closed,
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubError::Closed => write!(f, "Hub closed"),
        }
    }
}

impl std::error::Error for HubError {}

/// Mailbox commands.
pub(crate) enum HubCommand {
    Register {
        id: ConnectionId,
        outbound: mpsc::Sender<Utf8Bytes>,
        ready: oneshot::Sender<()>,
    },
    Unregister {
        id: ConnectionId,
    },
    Broadcast {
        from: ConnectionId,
        raw: Bytes,
    },
    Snapshot {
        reply: oneshot::Sender<Document>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
    Persist {
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable handle to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    project_id: Arc<str>,
    generation: u64,
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the hub task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Add a connection. Returns once the initial snapshot is queued on `outbound`.
    pub async fn register(
        &self,
        id: ConnectionId,
        outbound: mpsc::Sender<Utf8Bytes>,
    ) -> Result<(), HubError> {
        let (ready, done) = oneshot::channel();
        self.send(HubCommand::Register { id, outbound, ready }).await?;
        done.await.map_err(|_| HubError::Closed)
    }

    /// Remove a connection. Removing an unknown or already removed id is a no-op.
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        self.send(HubCommand::Unregister { id }).await
    }

    /// Submit raw frame bytes from a connection as a patch attempt.
    pub async fn broadcast(&self, from: ConnectionId, raw: Bytes) -> Result<(), HubError> {
        self.send(HubCommand::Broadcast { from, raw }).await
    }

    /// Current document, read inside the hub loop.
    pub async fn snapshot(&self) -> Result<Document, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Stats { reply }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Save the current document now. Resolves to whether the save succeeded.
    pub async fn persist(&self) -> Result<bool, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Persist { reply }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    async fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.tx.send(command).await.map_err(|_| HubError::Closed)
    }
}

/// Registered connection as seen by the hub.
struct Member {
    outbound: mpsc::Sender<Utf8Bytes>,
}

/// The coordination loop's state. Lives entirely inside one tokio task.
pub(crate) struct ProjectHub {
    project_id: Arc<str>,
    generation: u64,
    document: Document,
    /// Document changed since the last successful save
    dirty: bool,
    members: HashMap<ConnectionId, Member>,
    state: HubState,
    store: Arc<dyn DocumentStore>,
    registry: HubMap,
    config: HubConfig,
    idle_deadline: Option<Instant>,
    stats: HubStats,
}

impl ProjectHub {
    /// Start a hub task for `project_id` and return its handle.
    ///
    /// The document is loaded by the task itself before any command is
    /// handled, so the caller never waits on storage.
    pub(crate) fn spawn(
        project_id: &str,
        generation: u64,
        store: Arc<dyn DocumentStore>,
        registry: HubMap,
        config: HubConfig,
    ) -> HubHandle {
        let project_id: Arc<str> = Arc::from(project_id);
        let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));

        let hub = ProjectHub {
            project_id: project_id.clone(),
            generation,
            document: protocol::empty_document(),
            dirty: false,
            members: HashMap::new(),
            state: HubState::Idle,
            store,
            registry,
            config,
            idle_deadline: None,
            stats: HubStats {
                project_id: project_id.to_string(),
                state: HubState::Idle,
                connections: 0,
                patches_applied: 0,
                patches_rejected: 0,
                invalid_messages: 0,
                backpressure_drops: 0,
                saves: 0,
                save_failures: 0,
            },
        };
        tokio::spawn(hub.run(rx));

        HubHandle {
            project_id,
            generation,
            tx,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>) {
        self.document = self.load().await;
        self.become_idle();

        loop {
            let command = match self.idle_deadline {
                Some(deadline) => {
                    tokio::select! {
                        command = rx.recv() => command,
                        _ = tokio::time::sleep_until(deadline) => {
                            if self.try_evict(&mut rx).await {
                                return;
                            }
                            continue;
                        }
                    }
                }
                None => rx.recv().await,
            };

            match command {
                Some(command) => self.handle(command).await,
                None => break,
            }
        }

        debug!("Hub for project {} stopped", self.project_id);
    }

    async fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { id, outbound, ready } => {
                self.register(id, outbound).await;
                let _ = ready.send(());
            }
            HubCommand::Unregister { id } => {
                self.remove_member(id, RemovalReason::Disconnected).await;
            }
            HubCommand::Broadcast { from, raw } => {
                self.broadcast(from, raw).await;
            }
            HubCommand::Snapshot { reply } => {
                let _ = reply.send(self.document.clone());
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(self.snapshot_stats());
            }
            HubCommand::Persist { reply } => {
                let saved = self.persist().await;
                let _ = reply.send(saved);
            }
        }
    }

    async fn register(&mut self, id: ConnectionId, outbound: mpsc::Sender<Utf8Bytes>) {
        self.members.insert(id, Member { outbound });
        self.state = HubState::Active;
        self.idle_deadline = None;
        info!(
            "Connection {id} joined project {}. Total connections in project: {}",
            self.project_id,
            self.members.len()
        );

        // Initial sync: the first message every member sees is the full document
        let snapshot = match serde_json::to_string(&self.document) {
            Ok(json) => Utf8Bytes::from(json),
            Err(e) => {
                error!("Failed to encode snapshot for project {}: {e}", self.project_id);
                return;
            }
        };
        let queued = match self.members.get(&id) {
            Some(member) => member.outbound.try_send(snapshot),
            None => return,
        };
        match queued {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.remove_member(id, RemovalReason::Backpressure).await;
            }
            Err(TrySendError::Closed(_)) => {
                self.remove_member(id, RemovalReason::WriterClosed).await;
            }
        }
    }

    async fn broadcast(&mut self, from: ConnectionId, raw: Bytes) {
        let patch = match protocol::decode_patch(&raw) {
            Ok(patch) => patch,
            Err(e) => {
                self.stats.invalid_messages += 1;
                warn!("{e} from connection {from} in project {}", self.project_id);
                return;
            }
        };

        // Parsed JSON is always valid UTF-8
        let text = match Utf8Bytes::try_from(raw) {
            Ok(text) => text,
            Err(e) => {
                self.stats.invalid_messages += 1;
                warn!("Non UTF-8 patch from connection {from} in project {}: {e}", self.project_id);
                return;
            }
        };

        if let Err(e) = protocol::apply_patch(&mut self.document, &patch) {
            self.stats.patches_rejected += 1;
            warn!(
                "{e} (connection {from}, project {}); not broadcast",
                self.project_id
            );
            return;
        }
        self.dirty = true;
        self.stats.patches_applied += 1;
        debug!(
            "Applied {} op(s) from connection {from} in project {}: {}",
            patch.0.len(),
            self.project_id,
            text.as_str()
        );

        self.fan_out(text).await;
    }

    /// Queue `text` on every member without blocking; drop the ones that cannot take it.
    async fn fan_out(&mut self, text: Utf8Bytes) {
        let mut dropped = Vec::new();
        for (id, member) in &self.members {
            match member.outbound.try_send(text.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => dropped.push((*id, RemovalReason::Backpressure)),
                Err(TrySendError::Closed(_)) => dropped.push((*id, RemovalReason::WriterClosed)),
            }
        }
        for (id, reason) in dropped {
            self.remove_member(id, reason).await;
        }
    }

    /// The single removal path. Returns false if `id` was not a member.
    async fn remove_member(&mut self, id: ConnectionId, reason: RemovalReason) -> bool {
        // Dropping the sender closes the queue; the writer drains and exits
        let Some(member) = self.members.remove(&id) else {
            return false;
        };
        drop(member);

        if reason == RemovalReason::Backpressure {
            self.stats.backpressure_drops += 1;
            warn!(
                "Connection {id} in project {} {reason}",
                self.project_id
            );
        }

        self.persist().await;

        info!(
            "Connection {id} left project {} ({reason}). Total connections in project: {}",
            self.project_id,
            self.members.len()
        );

        if self.members.is_empty() {
            self.become_idle();
        }
        true
    }

    fn become_idle(&mut self) {
        match self.config.idle_eviction {
            Some(delay) => {
                self.state = HubState::IdlePendingEviction;
                self.idle_deadline = Some(Instant::now() + delay);
            }
            None => {
                self.state = HubState::Idle;
                self.idle_deadline = None;
            }
        }
    }

    /// Evict this hub if nothing happened during the idle window.
    ///
    /// Returns true when the hub has been removed from the registry and the
    /// task should end.
    async fn try_evict(&mut self, rx: &mut mpsc::Receiver<HubCommand>) -> bool {
        self.idle_deadline = None;

        if self.dirty && !self.persist().await {
            warn!(
                "Keeping project {} resident: unsaved changes",
                self.project_id
            );
            self.become_idle();
            return false;
        }

        {
            let mut hubs = self.registry.lock().await;
            // A command may have arrived while we waited for the lock
            if !self.members.is_empty() || !rx.is_empty() {
                drop(hubs);
                if self.members.is_empty() {
                    self.become_idle();
                }
                return false;
            }
            if hubs
                .get(self.project_id.as_ref())
                .is_some_and(|h| h.generation() == self.generation)
            {
                hubs.remove(self.project_id.as_ref());
            }
        }

        // No new handle can reach us now. Refuse whatever slipped in before
        // the map entry was removed; registrations retry against a fresh hub.
        rx.close();
        while let Some(command) = rx.recv().await {
            match command {
                HubCommand::Snapshot { reply } => {
                    let _ = reply.send(self.document.clone());
                }
                HubCommand::Persist { reply } => {
                    let _ = reply.send(!self.dirty);
                }
                _ => {}
            }
        }

        self.state = HubState::Evicted;
        info!("Evicted idle hub for project {}", self.project_id);
        true
    }

    /// Load the stored document; any failure starts from `{}`.
    async fn load(&self) -> Document {
        let store = self.store.clone();
        let project_id = self.project_id.clone();
        let loaded = tokio::task::spawn_blocking(move || store.load(&project_id)).await;

        match loaded {
            Ok(Ok(bytes)) => match protocol::decode_document(&bytes) {
                Ok(doc) => {
                    info!("Loaded existing data for project {}", self.project_id);
                    doc
                }
                Err(e) => {
                    warn!(
                        "Stored data for project {} is unreadable ({e}), starting fresh",
                        self.project_id
                    );
                    protocol::empty_document()
                }
            },
            Ok(Err(e)) if e.is_not_found() => {
                info!("No existing data for project {}, starting fresh", self.project_id);
                protocol::empty_document()
            }
            Ok(Err(e)) => {
                warn!(
                    "Failed to load project {} ({e}), starting fresh",
                    self.project_id
                );
                protocol::empty_document()
            }
            Err(e) => {
                error!("Load task for project {} failed: {e}", self.project_id);
                protocol::empty_document()
            }
        }
    }

    /// Save the current document. Failures are logged and leave the hub dirty.
    async fn persist(&mut self) -> bool {
        let bytes = match protocol::encode_document(&self.document) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.stats.save_failures += 1;
                error!("Failed to encode project {}: {e}", self.project_id);
                return false;
            }
        };

        let store = self.store.clone();
        let project_id = self.project_id.clone();
        let result = tokio::task::spawn_blocking(move || store.save(&project_id, &bytes)).await;

        match result {
            Ok(Ok(())) => {
                self.stats.saves += 1;
                self.dirty = false;
                debug!("Saved project {}", self.project_id);
                true
            }
            Ok(Err(e)) => {
                self.stats.save_failures += 1;
                error!("Failed to save project {}: {e}", self.project_id);
                false
            }
            Err(e) => {
                self.stats.save_failures += 1;
                error!("Save task for project {} failed: {e}", self.project_id);
                false
            }
        }
    }

    fn snapshot_stats(&self) -> HubStats {
        HubStats {
            state: self.state,
            connections: self.members.len(),
            ..self.stats.clone()
        }
    }
}
