//! # patchhub: Real-time JSON state synchronization server
//!
//! Clients connected under the same project identifier share one JSON
//! document. Edits arrive as JSON Patch (RFC 6902) arrays, are applied to
//! the server-held canonical copy and re-broadcast to every connection of
//! that project.
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐  /ws/{projectId}   ┌──────────────┐
//!            ├──────────────────► │ HubRegistry  │ get_or_create
//! Client B ──┘                    └──────┬───────┘
//!                                        ▼
//!   reader pump ── Broadcast ──► ┌──────────────┐ ── save on leave ──► DocumentStore
//!   writer pump ◄── fan-out ──── │ ProjectHub   │ ◄─ load on start ──  (fs / rocks / memory)
//!                                │ (one task)   │
//!                                └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: patch/document codec and URL routing
//! - [`hub`]: per-project coordination loop
//! - [`registry`]: project id → hub map
//! - [`connection`]: per-connection read/write pumps
//! - [`storage`]: document store trait and backends
//! - [`server`]: WebSocket listener and handshake
//! - [`client`]: WebSocket sync client with offline queue
//! - [`filter`]: key filters for partial sync
//! - [`config`]: server configuration

pub mod protocol;
pub mod hub;
pub mod registry;
pub mod connection;
pub mod storage;
pub mod server;
pub mod client;
pub mod filter;
pub mod config;

// Re-exports for convenience
pub use protocol::{Document, ProtocolError};
pub use hub::{ConnectionId, HubConfig, HubError, HubHandle, HubState, HubStats, RemovalReason};
pub use registry::{HubRegistry, Membership};
pub use connection::Connection;
pub use storage::{DocumentStore, FileStore, MemoryStore, RocksStore, StoreConfig, StoreError};
pub use server::{ServerError, SyncServer};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use filter::StateFilter;
pub use config::{ConfigError, ServerConfig, StorageBackend};
