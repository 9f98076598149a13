//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - A local replica kept in step with the server document
//! - State diffing into JSON patches, optionally through a [`StateFilter`]
//! - Offline queue for patches made while disconnected
//!
//! The replica only changes when the server says so. A patch sent by this
//! client is applied when the server echoes it back, same as everyone else's.
//! Until then it is tracked as in flight, and [`SyncClient::update`] diffs
//! against the replica with every in-flight and queued patch applied, so
//! back-to-back updates never resend the same operations.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use json_patch::Patch;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::filter::StateFilter;
use crate::protocol::{
    apply_patch, decode_document, decode_patch, empty_document, Document, ProtocolError,
};

const EVENT_CAPACITY: usize = 256;
const OUTGOING_CAPACITY: usize = 256;
const OFFLINE_QUEUE_CAPACITY: usize = 10_000;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// WebSocket upgraded
    Connected,
    /// Initial document received; the replica now equals it
    Synced(Document),
    /// A patch from the server, already applied to the replica
    RemotePatch(Patch),
    /// A server patch did not apply to the replica. The connection is
    /// dropped; reconnecting fetches a fresh snapshot.
    OutOfSync,
    /// Connection lost or closed
    Disconnected,
}

/// Patches made while disconnected, replayed in order on reconnect.
pub struct OfflineQueue {
    queue: VecDeque<Patch>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a patch. Returns false when full.
    pub fn enqueue(&mut self, patch: Patch) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(patch);
        true
    }

    pub fn drain(&mut self) -> Vec<Patch> {
        self.queue.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Patch> {
        self.queue.iter()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total operations queued across all patches.
    pub fn total_operations(&self) -> usize {
        self.queue.iter().map(|p| p.0.len()).sum()
    }
}

/// State shared between the client and its reader task.
struct Local {
    state: ConnectionState,
    /// Bumped on every connect and disconnect. A reader only acts while its epoch is current.
    epoch: u64,
    /// Snapshot received on the current connection
    synced: bool,
    replica: Document,
    /// Sent but not yet echoed, oldest first, with the exact wire text
    in_flight: VecDeque<(String, Patch)>,
    offline: OfflineQueue,
}

impl Local {
    fn new(offline_capacity: usize) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            epoch: 0,
            synced: false,
            replica: empty_document(),
            in_flight: VecDeque::new(),
            offline: OfflineQueue::new(offline_capacity),
        }
    }

    /// The replica as it will be once everything sent or queued is applied.
    fn pending_state(&self) -> Document {
        let mut doc = self.replica.clone();
        let pending = self.in_flight.iter().map(|(_, p)| p).chain(self.offline.iter());
        for patch in pending {
            // One that no longer applies will be rejected by the server too
            let _ = apply_patch(&mut doc, patch);
        }
        doc
    }

    /// Handle one frame from the server.
    ///
    /// `Err` means the replica can no longer follow the server.
    fn on_frame(&mut self, raw: &[u8]) -> Result<Option<SyncEvent>, ProtocolError> {
        if !self.synced {
            return match decode_document(raw) {
                Ok(doc) => {
                    self.synced = true;
                    self.replica = doc.clone();
                    Ok(Some(SyncEvent::Synced(doc)))
                }
                Err(e) => {
                    warn!("Ignoring undecodable snapshot from server: {e}");
                    Ok(None)
                }
            };
        }

        let patch = match decode_patch(raw) {
            Ok(patch) => patch,
            Err(e) => {
                warn!("Ignoring undecodable frame from server: {e}");
                return Ok(None);
            }
        };
        apply_patch(&mut self.replica, &patch)?;
        self.acknowledge(raw);
        Ok(Some(SyncEvent::RemotePatch(patch)))
    }

    /// Retire the in-flight patch this frame echoes.
    ///
    /// The hub handles one connection's frames in order, so older in-flight
    /// patches with no echo of their own were rejected.
    fn acknowledge(&mut self, raw: &[u8]) {
        let Some(pos) = self.in_flight.iter().position(|(text, _)| text.as_bytes() == raw) else {
            return;
        };
        if pos > 0 {
            debug!("{pos} sent patch(es) were not applied by the server");
        }
        self.in_flight.drain(..=pos);
    }
}

/// The sync client.
pub struct SyncClient {
    server_url: String,
    project_id: String,
    filter: StateFilter,

    local: Arc<Mutex<Local>>,

    /// Frames for the writer task; `None` while disconnected
    outgoing_tx: Option<mpsc::Sender<String>>,
    reader: Option<JoinHandle<()>>,

    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    /// `server_url` is the route prefix, e.g. `ws://host:8080/ws`.
    pub fn new(server_url: impl Into<String>, project_id: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        Self {
            server_url: server_url.into(),
            project_id: project_id.into(),
            filter: StateFilter::All,
            local: Arc::new(Mutex::new(Local::new(OFFLINE_QUEUE_CAPACITY))),
            outgoing_tx: None,
            reader: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Only sync the part of the state the filter selects.
    pub fn with_filter(mut self, filter: StateFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Full connection URL: `{server_url}/{projectId}`.
    pub fn url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.project_id)
    }

    /// Connect and start the reader/writer tasks, then replay queued patches.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.stop_tasks();
        let epoch = {
            let mut local = self.local.lock().await;
            local.epoch += 1;
            local.state = ConnectionState::Connecting;
            local.epoch
        };

        let url = self.url();
        let ws = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                warn!("Failed to connect to {url}: {e}");
                let mut local = self.local.lock().await;
                if local.epoch == epoch {
                    local.state = ConnectionState::Disconnected;
                }
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws.split();

        {
            let mut local = self.local.lock().await;
            local.state = ConnectionState::Connected;
            local.synced = false;
            // The coming snapshot already reflects whatever the server applied
            local.in_flight.clear();
        }
        // Before the reader starts, so its events follow this one
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTGOING_CAPACITY);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            loop {
                let text = tokio::select! {
                    biased;
                    text = out_rx.recv() => match text {
                        Some(text) => text,
                        None => break,
                    },
                    _ = &mut stop_rx => break,
                };
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
            let _ = ws_writer.close().await;
        });

        let event_tx = self.event_tx.clone();
        let shared = self.local.clone();
        self.reader = Some(tokio::spawn(async move {
            let mut current = true;
            while let Some(msg) = ws_reader.next().await {
                let raw = match msg {
                    Ok(Message::Text(text)) => text.as_str().as_bytes().to_vec(),
                    Ok(Message::Binary(data)) => data.to_vec(),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };

                let mut local = shared.lock().await;
                if local.epoch != epoch {
                    current = false;
                    break;
                }
                match local.on_frame(&raw) {
                    Ok(Some(event)) => {
                        drop(local);
                        let _ = event_tx.send(event).await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        drop(local);
                        warn!("Replica out of step with server ({e}), dropping connection");
                        let _ = event_tx.send(SyncEvent::OutOfSync).await;
                        break;
                    }
                }
            }

            // Ends the writer, which closes the socket
            drop(stop_tx);
            if !current {
                return;
            }
            let mut local = shared.lock().await;
            if local.epoch == epoch && local.state == ConnectionState::Connected {
                local.state = ConnectionState::Disconnected;
                drop(local);
                let _ = event_tx.send(SyncEvent::Disconnected).await;
            }
        }));

        self.outgoing_tx = Some(out_tx);
        info!("Connected to project {}", self.project_id);

        let mut local = self.local.lock().await;
        let queued = local.offline.drain();
        if !queued.is_empty() {
            info!("Replaying {} queued patches", queued.len());
            for patch in queued {
                self.submit(&mut local, patch).await?;
            }
        }

        Ok(())
    }

    /// Close the connection and emit `Disconnected`.
    pub async fn disconnect(&mut self) {
        self.stop_tasks();
        let was_connected = {
            let mut local = self.local.lock().await;
            // Any reader still draining the old socket is now stale
            local.epoch += 1;
            let was_connected = local.state == ConnectionState::Connected;
            local.state = ConnectionState::Disconnected;
            was_connected
        };
        if was_connected {
            let _ = self.event_tx.send(SyncEvent::Disconnected).await;
        }
    }

    /// Abort the reader and drop the writer's queue; the writer flushes, then closes the socket.
    fn stop_tasks(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.outgoing_tx = None;
    }

    /// Send a patch, or queue it while disconnected.
    pub async fn send_patch(&self, patch: Patch) -> Result<(), ProtocolError> {
        let mut local = self.local.lock().await;
        self.submit(&mut local, patch).await
    }

    /// Diff the pending state against `desired` (both filtered) and send the difference.
    ///
    /// Returns the patch that was sent, or `None` when nothing changed.
    pub async fn update(&self, desired: &Document) -> Result<Option<Patch>, ProtocolError> {
        // Held across diff and send so concurrent updates see each other
        let mut local = self.local.lock().await;
        let current = self.filter.apply(&local.pending_state());
        let target = self.filter.apply(desired);
        let patch = json_patch::diff(&current, &target);
        if patch.0.is_empty() {
            return Ok(None);
        }
        self.submit(&mut local, patch.clone()).await?;
        Ok(Some(patch))
    }

    async fn submit(&self, local: &mut Local, patch: Patch) -> Result<(), ProtocolError> {
        if local.state == ConnectionState::Connected {
            if let Some(tx) = &self.outgoing_tx {
                let text = encode_patch(&patch)?;
                // Recorded first so the echo always finds it
                local.in_flight.push_back((text.clone(), patch.clone()));
                if tx.send(text).await.is_ok() {
                    return Ok(());
                }
                local.in_flight.pop_back();
                debug!("Writer closed, queueing patch");
            }
        }

        if local.offline.enqueue(patch) {
            Ok(())
        } else {
            Err(ProtocolError::OfflineQueueFull)
        }
    }

    /// Copy of the current replica.
    pub async fn replica(&self) -> Document {
        self.local.lock().await.replica.clone()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.local.lock().await.state
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn filter(&self) -> &StateFilter {
        &self.filter
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.local.lock().await.offline.len()
    }

    /// Patches sent on the current connection that the server has not echoed yet.
    pub async fn in_flight_len(&self) -> usize {
        self.local.lock().await.in_flight.len()
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

fn encode_patch(patch: &Patch) -> Result<String, ProtocolError> {
    serde_json::to_string(patch).map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patch(value: serde_json::Value) -> Patch {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_client_url() {
        let client = SyncClient::new("ws://localhost:8080/ws/", "alpha");
        assert_eq!(client.url(), "ws://localhost:8080/ws/alpha");
        let client = SyncClient::new("ws://localhost:8080/ws", "alpha");
        assert_eq!(client.url(), "ws://localhost:8080/ws/alpha");
        assert_eq!(client.project_id(), "alpha");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new("ws://localhost:1/ws", "alpha");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.replica().await, json!({}));
        assert!(client.filter().is_all());
    }

    #[tokio::test]
    async fn test_send_patch_offline_queues() {
        let client = SyncClient::new("ws://localhost:1/ws", "alpha");
        client
            .send_patch(patch(json!([{"op": "add", "path": "/x", "value": 1}])))
            .await
            .unwrap();
        assert_eq!(client.offline_queue_len().await, 1);
        // Server-authoritative: nothing applied locally
        assert_eq!(client.replica().await, json!({}));
    }

    #[tokio::test]
    async fn test_update_diffs_filtered_state() {
        let client =
            SyncClient::new("ws://localhost:1/ws", "alpha").with_filter(StateFilter::keys(["x"]));

        let sent = client
            .update(&json!({"x": 1, "local_only": true}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent, patch(json!([{"op": "add", "path": "/x", "value": 1}])));

        // Diffed against the queued edit, and only unfiltered keys changed: nothing to send
        assert!(client
            .update(&json!({"x": 1, "local_only": false}))
            .await
            .unwrap()
            .is_none());
        assert_eq!(client.offline_queue_len().await, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_stays_disconnected() {
        let mut client = SyncClient::new("ws://127.0.0.1:1/ws", "alpha");
        assert_eq!(client.connect().await, Err(ProtocolError::ConnectionClosed));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new("ws://localhost:1/ws", "alpha");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(10);
        assert!(queue.is_empty());
        queue.enqueue(patch(json!([{"op": "add", "path": "/a", "value": 1}])));
        queue.enqueue(patch(json!([
            {"op": "add", "path": "/b", "value": 2},
            {"op": "remove", "path": "/a"}
        ])));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_operations(), 3);

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(2);
        assert!(queue.enqueue(Patch(vec![])));
        assert!(queue.enqueue(Patch(vec![])));
        assert!(!queue.enqueue(Patch(vec![])));
        queue.clear();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_full_offline_queue_errors() {
        let mut client = SyncClient::new("ws://localhost:1/ws", "alpha");
        client.local = Arc::new(Mutex::new(Local::new(1)));
        client.send_patch(Patch(vec![])).await.unwrap();
        assert_eq!(
            client.send_patch(Patch(vec![])).await,
            Err(ProtocolError::OfflineQueueFull)
        );
    }

    fn wire(value: serde_json::Value) -> String {
        serde_json::to_string(&value).unwrap()
    }

    fn synced_local(replica: serde_json::Value) -> Local {
        let mut local = Local::new(16);
        local.synced = true;
        local.replica = replica;
        local
    }

    #[tokio::test]
    async fn test_back_to_back_updates_do_not_repeat_operations() {
        let client = SyncClient::new("ws://localhost:1/ws", "alpha");
        client.local.lock().await.replica = json!({"list": []});

        client.update(&json!({"list": [1]})).await.unwrap().unwrap();
        client.update(&json!({"list": [1, 2]})).await.unwrap().unwrap();
        assert!(client.update(&json!({"list": [1, 2]})).await.unwrap().is_none());

        // The server applies the queue in order to what it holds
        let mut server_doc = json!({"list": []});
        for patch in client.local.lock().await.offline.iter() {
            apply_patch(&mut server_doc, patch).unwrap();
        }
        assert_eq!(server_doc, json!({"list": [1, 2]}));
    }

    #[test]
    fn test_first_frame_is_snapshot() {
        let mut local = Local::new(16);
        let event = local.on_frame(br#"{"seed":1}"#).unwrap();
        assert_eq!(event, Some(SyncEvent::Synced(json!({"seed": 1}))));
        assert_eq!(local.replica, json!({"seed": 1}));

        // Not a patch: ignored, replica untouched
        assert_eq!(local.on_frame(b"not-json").unwrap(), None);
        assert_eq!(local.replica, json!({"seed": 1}));
    }

    #[test]
    fn test_echo_retires_in_flight_patch() {
        let mut local = synced_local(json!({"list": []}));
        let first = json!([{"op": "add", "path": "/list/0", "value": 1}]);
        let second = json!([{"op": "add", "path": "/list/1", "value": 2}]);
        local.in_flight.push_back((wire(first.clone()), patch(first.clone())));
        local.in_flight.push_back((wire(second.clone()), patch(second.clone())));
        assert_eq!(local.pending_state(), json!({"list": [1, 2]}));

        local.on_frame(wire(first).as_bytes()).unwrap();
        assert_eq!(local.in_flight.len(), 1);
        assert_eq!(local.replica, json!({"list": [1]}));
        assert_eq!(local.pending_state(), json!({"list": [1, 2]}));

        local.on_frame(wire(second).as_bytes()).unwrap();
        assert!(local.in_flight.is_empty());
        assert_eq!(local.replica, json!({"list": [1, 2]}));
    }

    #[test]
    fn test_remote_patch_keeps_own_in_flight() {
        let mut local = synced_local(json!({}));
        let mine = json!([{"op": "add", "path": "/mine", "value": true}]);
        local.in_flight.push_back((wire(mine.clone()), patch(mine)));

        let theirs = wire(json!([{"op": "add", "path": "/theirs", "value": true}]));
        local.on_frame(theirs.as_bytes()).unwrap();
        assert_eq!(local.in_flight.len(), 1);
        assert_eq!(local.pending_state(), json!({"mine": true, "theirs": true}));
    }

    #[test]
    fn test_later_echo_drops_rejected_patches() {
        let mut local = synced_local(json!({}));
        let rejected = json!([{"op": "remove", "path": "/missing"}]);
        let accepted = json!([{"op": "add", "path": "/x", "value": 1}]);
        local.in_flight.push_back((wire(rejected.clone()), patch(rejected)));
        local.in_flight.push_back((wire(accepted.clone()), patch(accepted.clone())));

        local.on_frame(wire(accepted).as_bytes()).unwrap();
        assert!(local.in_flight.is_empty());
        assert_eq!(local.replica, json!({"x": 1}));
    }

    #[test]
    fn test_unappliable_server_patch_is_out_of_sync() {
        let mut local = synced_local(json!({"a": 1}));
        let result = local.on_frame(br#"[{"op":"remove","path":"/missing"}]"#);
        assert!(matches!(result, Err(ProtocolError::PatchRejected(_))));
        assert_eq!(local.replica, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_disconnect_when_never_connected_is_silent() {
        let mut client = SyncClient::new("ws://localhost:1/ws", "alpha");
        let mut events = client.take_event_rx().unwrap();
        client.disconnect().await;
        assert!(events.try_recv().is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }
}
