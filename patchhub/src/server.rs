//! WebSocket listener with project routing.
//!
//! ```text
//! TCP accept ──► handshake: GET /ws/{projectId}
//!                   │  bad path → HTTP 400, no upgrade
//!                   ▼
//!               registry.join(projectId) ──► Connection::spawn(ws)
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::config::{ServerConfig, StorageBackend};
use crate::connection::Connection;
use crate::hub::HubError;
use crate::protocol::project_id_from_path;
use crate::registry::HubRegistry;
use crate::storage::{DocumentStore, FileStore, MemoryStore, RocksStore, StoreConfig, StoreError};

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<HubRegistry>,
}

impl SyncServer {
    /// Open the configured store and build an empty registry on it.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store = open_store(&config.storage)?;
        Ok(Self::with_store(config, store))
    }

    /// Build on an already opened store. `config.storage` is ignored.
    pub fn with_store(config: ServerConfig, store: Arc<dyn DocumentStore>) -> Self {
        let registry = Arc::new(HubRegistry::new(store, config.hub.clone()));
        Self { config, registry }
    }

    /// Bind `config.bind_addr` and serve until the process ends.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an existing listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.serve_until(listener, std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then save every live document.
    pub async fn serve_until<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = listener.local_addr() {
            info!("Sync server listening on {addr}");
        }
        tokio::pin!(shutdown);

        loop {
            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        // Per-socket failures (e.g. EMFILE) should not stop the listener
                        warn!("Failed to accept connection: {e}");
                        continue;
                    }
                },
                _ = &mut shutdown => break,
            };
            debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, registry).await {
                    match e {
                        ServerError::Rejected(reason) => {
                            info!("Rejected connection from {addr}: {reason}")
                        }
                        e => error!("Connection error from {addr}: {e}"),
                    }
                }
            });
        }

        info!("Shutting down, saving {} hubs", self.registry.hub_count().await);
        let saved = self.registry.persist_all().await;
        info!("Saved {saved} documents");
        Ok(())
    }

    pub fn registry(&self) -> &Arc<HubRegistry> {
        &self.registry
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

fn open_store(backend: &StorageBackend) -> Result<Arc<dyn DocumentStore>, ServerError> {
    let store: Arc<dyn DocumentStore> = match backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::FileSystem(path) => Arc::new(FileStore::open(path)?),
        StorageBackend::Rocks(path) => Arc::new(RocksStore::open(StoreConfig::at(path))?),
    };
    info!("Using {} document store", backend_name(backend));
    Ok(store)
}

fn backend_name(backend: &StorageBackend) -> String {
    match backend {
        StorageBackend::Memory => "in-memory".to_string(),
        StorageBackend::FileSystem(path) => format!("file system ({})", path.display()),
        StorageBackend::Rocks(path) => format!("RocksDB ({})", path.display()),
    }
}

/// Upgrade one TCP stream, register it and start its pumps.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<HubRegistry>,
) -> Result<(), ServerError> {
    let mut project_id: Option<String> = None;
    let mut rejection: Option<String> = None;

    let route = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match project_id_from_path(request.uri().path()) {
            Ok(id) => {
                project_id = Some(id.to_string());
                Ok(response)
            }
            Err(e) => {
                let reason = e.to_string();
                rejection = Some(reason.clone());
                Err(bad_request(reason))
            }
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, route).await {
        Ok(ws) => ws,
        Err(e) => {
            return Err(match rejection {
                Some(reason) => ServerError::Rejected(reason),
                None => ServerError::Handshake(e),
            });
        }
    };
    let Some(project_id) = project_id else {
        return Err(ServerError::Rejected("missing project id".into()));
    };

    let membership = registry.join(&project_id).await?;
    info!(
        "Client {} from {addr} connected to project {project_id}",
        membership.id
    );
    Connection::new(membership).spawn(ws);
    Ok(())
}

fn bad_request(reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

/// Server errors.
#[derive(Debug)]
pub enum ServerError {
    Io(std::io::Error),
    Store(StoreError),
    Handshake(tungstenite::Error),
    /// Upgrade refused with HTTP 400
    Rejected(String),
    Hub(HubError),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Io(e) => write!(f, "IO error: {e}"),
            ServerError::Store(e) => write!(f, "Storage error: {e}"),
            ServerError::Handshake(e) => write!(f, "WebSocket handshake failed: {e}"),
            ServerError::Rejected(reason) => write!(f, "Upgrade rejected: {reason}"),
            ServerError::Hub(e) => write!(f, "Hub error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Io(e)
    }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        ServerError::Store(e)
    }
}

impl From<HubError> for ServerError {
    fn from(e: HubError) -> Self {
        ServerError::Hub(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_creation_in_memory() {
        let server = SyncServer::new(ServerConfig::in_memory("127.0.0.1:0")).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_server_with_file_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage: StorageBackend::FileSystem(dir.path().join("docs")),
            ..ServerConfig::in_memory("127.0.0.1:0")
        };
        let server = SyncServer::new(config).unwrap();
        assert!(dir.path().join("docs").is_dir());
        assert_eq!(server.registry().hub_count().await, 0);
    }

    #[tokio::test]
    async fn test_server_with_rocks_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage: StorageBackend::Rocks(dir.path().join("db")),
            ..ServerConfig::in_memory("127.0.0.1:0")
        };
        assert!(SyncServer::new(config).is_ok());
    }

    #[tokio::test]
    async fn test_serve_until_persists_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let server = SyncServer::with_store(ServerConfig::in_memory("127.0.0.1:0"), store.clone());
        server.registry().get_or_create("alpha").await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        server.serve_until(listener, async {}).await.unwrap();

        assert_eq!(store.load("alpha").unwrap(), b"{}");
    }

    #[test]
    fn test_bad_request_response() {
        let response = bad_request("nope".into());
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.body().as_deref(), Some("nope"));
    }

    #[test]
    fn test_server_error_display() {
        let err = ServerError::Rejected("Project ID is required in URL path: /ws/{projectId}".into());
        assert!(err.to_string().starts_with("Upgrade rejected"));
        let err: ServerError = HubError::Closed.into();
        assert!(matches!(err, ServerError::Hub(HubError::Closed)));
    }
}
