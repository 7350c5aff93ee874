//! WebSocket server exposing [`CollabService`].
//!
//! Architecture:
//! ```text
//! Client A ──┐                           ┌── DocumentStore (RocksDB)
//!             ├── connection task ── CollabService
//! Client B ──┘    (select loop)          └── ChangeBroadcaster ──► per-connection
//!                   │   │   │                                       LatestSnapshotSink
//!                   │   │   └── 30s Heartbeat frame
//!                   │   └────── pushed Updated (read gate applied per viewer)
//!                   └────────── request / response
//! ```
//!
//! A connection watches at most one path: the last one it loaded. On
//! disconnect it leaves that path's presence and drops its subscription.
//! A maintenance task purges expired sessions and stale presence records.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::access::AccessError;
use crate::admin::AdminError;
use crate::broadcast::{SnapshotReceiver, SubscriptionHandle};
use crate::document::{normalize_path, DocumentSnapshot};
use crate::presence::PRESENCE_TTL;
use crate::protocol::{AdminOp, ClientMessage, ErrorKind, ServerMessage};
use crate::service::{CollabService, ServiceConfig, ServiceError};
use crate::session::{SessionConfig, SESSION_TTL};
use crate::storage::{DocumentStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Keep-alive frame interval on push connections
    pub heartbeat_interval_secs: u64,
    /// Session purge and presence sweep interval
    pub maintenance_interval_secs: u64,
    pub session_ttl_secs: u64,
    pub presence_ttl_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// None disables administration
    pub admin_password: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            heartbeat_interval_secs: 30,
            maintenance_interval_secs: 60,
            session_ttl_secs: SESSION_TTL.as_secs(),
            presence_ttl_secs: PRESENCE_TTL.as_secs(),
            storage_path: None,
            admin_password: None,
        }
    }
}

impl ServerConfig {
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            session: SessionConfig {
                ttl: Duration::from_secs(self.session_ttl_secs),
            },
            presence_ttl: Duration::from_secs(self.presence_ttl_secs),
            admin_password: self.admin_password.clone(),
            ..ServiceConfig::default()
        }
    }

    fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_messages: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    service: Arc<CollabService>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening RocksDB when `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let clock = crate::clock::system_clock();
        let store = match &config.storage_path {
            Some(path) => DocumentStore::open(
                StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                },
                clock,
            )?,
            None => DocumentStore::in_memory(clock),
        };
        let service = CollabService::new(Arc::new(store), config.service_config());
        Ok(Self::with_service(config, Arc::new(service)))
    }

    /// Wrap an existing service (tests inject one with a manual clock).
    pub fn with_service(config: ServerConfig, service: Arc<CollabService>) -> Self {
        Self {
            config,
            service,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Self {
        let config = ServerConfig::default();
        let service = CollabService::in_memory(crate::clock::system_clock(), config.service_config());
        Self::with_service(config, Arc::new(service))
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let maintenance = tokio::spawn(Self::maintenance_loop(
            self.service.clone(),
            self.config.maintenance_interval(),
        ));

        let result: Result<(), BoxError> = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            log::debug!("New TCP connection from {addr}");

            let service = self.service.clone();
            let stats = self.stats.clone();
            let heartbeat = self.config.heartbeat_interval();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, service, stats, heartbeat).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        maintenance.abort();
        result
    }

    async fn maintenance_loop(service: Arc<CollabService>, every: Duration) {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            service.purge_expired();
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        service: Arc<CollabService>,
        stats: Arc<RwLock<ServerStats>>,
        heartbeat_every: Duration,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut conn = Connection::new(service);
        let outcome = conn
            .pump(&mut ws_sender, &mut ws_receiver, addr, &stats, heartbeat_every)
            .await;

        conn.close().await;
        stats.write().await.active_connections -= 1;
        log::info!("Connection closed from {addr}");
        outcome
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn service(&self) -> &Arc<CollabService> {
        &self.service
    }
}

/// The path a connection is watching, and as whom.
struct Watch {
    path: String,
    viewer_id: String,
    session_token: Option<String>,
    handle: SubscriptionHandle,
    receiver: SnapshotReceiver,
}

/// Per-connection state.
struct Connection {
    service: Arc<CollabService>,
    watch: Option<Watch>,
}

impl Connection {
    fn new(service: Arc<CollabService>) -> Self {
        Self { service, watch: None }
    }

    async fn pump(
        &mut self,
        ws_sender: &mut WsSender,
        ws_receiver: &mut WsReceiver,
        addr: SocketAddr,
        stats: &RwLock<ServerStats>,
        heartbeat_every: Duration,
    ) -> Result<(), BoxError> {
        let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            let reply = match ClientMessage::decode(&data) {
                                Ok(request) => self.handle(request).await,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    stats.write().await.rejected_messages += 1;
                                    ServerMessage::error(ErrorKind::BadRequest, e.to_string())
                                }
                            };
                            send(ws_sender, &reply).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => break,

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Change on the watched path
                change = async {
                    match self.watch.as_mut() {
                        Some(watch) => watch.receiver.changed().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match change {
                        Some(snapshot) => {
                            if let Some(update) = self.visible(&snapshot) {
                                send(ws_sender, &ServerMessage::Updated(update)).await?;
                            }
                        }
                        None => self.watch = None,
                    }
                }

                _ = heartbeat.tick() => {
                    let at = self.service.store().clock().now_secs();
                    send(ws_sender, &ServerMessage::Heartbeat { at }).await?;
                }
            }
        }

        Ok(())
    }

    async fn handle(&mut self, request: ClientMessage) -> ServerMessage {
        let service = self.service.clone();
        match request {
            ClientMessage::Load {
                path,
                viewer_id,
                session_token,
                visitor_key,
            } => {
                let path = normalize_path(&path);
                match service.open(&path, &viewer_id, session_token.as_deref(), visitor_key.as_deref()) {
                    Ok(view) => {
                        self.attach(path, viewer_id, session_token).await;
                        ServerMessage::Loaded(view)
                    }
                    Err(e) => error_reply(&path, e),
                }
            }

            ClientMessage::Save {
                path,
                text,
                password,
                format,
            } => {
                let path = normalize_path(&path);
                match service
                    .save(&path, &text, password.as_deref(), format.as_deref())
                    .await
                {
                    Ok(snapshot) => ServerMessage::Saved(snapshot),
                    Err(e) => error_reply(&path, e),
                }
            }

            ClientMessage::Unlock {
                path,
                viewer_id,
                password,
            } => {
                let path = normalize_path(&path);
                match service.unlock(&path, &viewer_id, password.as_deref()).await {
                    Ok(unlocked) => {
                        if let (Some(watch), Some(grant)) = (self.watching_mut(&path, &viewer_id), &unlocked.session) {
                            watch.session_token = Some(grant.token.clone());
                        }
                        ServerMessage::Unlocked {
                            view: unlocked.view,
                            session: unlocked.session,
                        }
                    }
                    Err(e) => error_reply(&path, e),
                }
            }

            ClientMessage::SignOut { path, viewer_id } => {
                let path = normalize_path(&path);
                service.sign_out(&path, &viewer_id);
                if let Some(watch) = self.watching_mut(&path, &viewer_id) {
                    watch.session_token = None;
                }
                ServerMessage::SignedOut { path }
            }

            ClientMessage::SetAccess { path, change } => {
                let path = normalize_path(&path);
                match service.set_access(&path, &change).await {
                    Ok(summary) => ServerMessage::AccessUpdated(summary),
                    Err(e) => error_reply(&path, e),
                }
            }

            ClientMessage::Related { path } => {
                let path = normalize_path(&path);
                match service.related(&path) {
                    Ok(children) => ServerMessage::Related { path, children },
                    Err(e) => error_reply(&path, e),
                }
            }

            ClientMessage::Heartbeat { path, viewer_id } => {
                let path = normalize_path(&path);
                let count = service.heartbeat(&path, &viewer_id);
                ServerMessage::ActiveViewers { path, count }
            }

            ClientMessage::Leave { path, viewer_id } => {
                let path = normalize_path(&path);
                let count = service.leave(&path, &viewer_id);
                ServerMessage::ActiveViewers { path, count }
            }

            ClientMessage::Poll {
                path,
                viewer_id,
                session_token,
                since,
            } => {
                let path = normalize_path(&path);
                match service.poll(&path, &viewer_id, session_token.as_deref(), since) {
                    Ok(snapshot) => ServerMessage::PollResult { path, snapshot },
                    Err(e) => error_reply(&path, e),
                }
            }

            ClientMessage::Ping => ServerMessage::Pong,

            ClientMessage::AdminLogin { password } => match service.admin_login(&password) {
                Ok(token) => ServerMessage::AdminToken { token },
                Err(e) => error_reply("", e),
            },

            ClientMessage::Admin { token, op } => admin(&service, &token, op).await,
        }
    }

    /// Start watching `path`, replacing any earlier watch.
    async fn attach(&mut self, path: String, viewer_id: String, session_token: Option<String>) {
        if let Some(watch) = &mut self.watch {
            if watch.path == path && watch.viewer_id == viewer_id {
                watch.session_token = session_token;
                return;
            }
        }
        self.detach().await;
        let (handle, receiver) = self.service.subscribe(&path).await;
        log::debug!("Viewer {viewer_id} watching {path}");
        self.watch = Some(Watch {
            path,
            viewer_id,
            session_token,
            handle,
            receiver,
        });
    }

    async fn detach(&mut self) {
        if let Some(watch) = self.watch.take() {
            self.service.leave(&watch.path, &watch.viewer_id);
            self.service.unsubscribe(&watch.handle).await;
        }
    }

    async fn close(&mut self) {
        self.detach().await;
    }

    fn watching_mut(&mut self, path: &str, viewer_id: &str) -> Option<&mut Watch> {
        self.watch
            .as_mut()
            .filter(|watch| watch.path == path && watch.viewer_id == viewer_id)
    }

    /// Apply the read gate for this connection's viewer.
    fn visible(&self, snapshot: &DocumentSnapshot) -> Option<DocumentSnapshot> {
        let watch = self.watch.as_ref()?;
        match self
            .service
            .visible_snapshot(snapshot, &watch.viewer_id, watch.session_token.as_deref())
        {
            Ok(visible) => visible,
            Err(e) => {
                log::error!("Dropping update for {}: {e}", snapshot.path);
                None
            }
        }
    }
}

async fn admin(service: &CollabService, token: &str, op: AdminOp) -> ServerMessage {
    match op {
        AdminOp::ListDocuments => match service.admin_list(token) {
            Ok(docs) => ServerMessage::AdminDocuments(docs),
            Err(e) => error_reply("", e),
        },
        AdminOp::Block { path, reason } => match service.admin_block(token, &path, reason.as_deref()) {
            Ok(summary) => ServerMessage::AdminUpdated(Some(summary)),
            Err(e) => error_reply(&path, e),
        },
        AdminOp::Unblock { path } => match service.admin_unblock(token, &path) {
            Ok(summary) => ServerMessage::AdminUpdated(summary),
            Err(e) => error_reply(&path, e),
        },
        AdminOp::ChangePassword {
            path,
            current_password,
            new_password,
        } => match service
            .admin_change_password(token, &path, &current_password, &new_password)
            .await
        {
            Ok(summary) => ServerMessage::AdminUpdated(Some(summary)),
            Err(e) => error_reply(&path, e),
        },
        AdminOp::OverridePassword { path, new_password } => {
            match service.admin_override_password(token, &path, &new_password).await {
                Ok(summary) => ServerMessage::AdminUpdated(Some(summary)),
                Err(e) => error_reply(&path, e),
            }
        }
        AdminOp::Logout => match service.admin_logout(token) {
            Ok(()) => ServerMessage::AdminLoggedOut,
            Err(e) => error_reply("", e),
        },
    }
}

/// Map a failure onto the wire. Blocked documents get their own frame.
fn error_reply(path: &str, e: ServiceError) -> ServerMessage {
    match e {
        ServiceError::Access(AccessError::DocumentBlocked { reason, blocked_at }) => ServerMessage::Blocked {
            path: path.to_string(),
            reason,
            blocked_at,
        },
        ServiceError::Access(AccessError::Storage(e)) => {
            log::error!("Storage failure on {path}: {e}");
            ServerMessage::error(ErrorKind::Internal, "internal error")
        }
        ServiceError::Access(e) => ServerMessage::error(ErrorKind::from(&e), e.to_string()),
        ServiceError::Admin(e @ AdminError::InvalidCredentials) => {
            ServerMessage::error(ErrorKind::IncorrectPassword, e.to_string())
        }
        ServiceError::Admin(e) => ServerMessage::error(ErrorKind::Unauthorized, e.to_string()),
        ServiceError::Worker(e) => {
            log::error!("Access worker failed on {path}: {e}");
            ServerMessage::error(ErrorKind::Internal, "internal error")
        }
    }
}

async fn send(ws_sender: &mut WsSender, msg: &ServerMessage) -> Result<(), BoxError> {
    let encoded = msg.encode()?;
    ws_sender.send(Message::Binary(encoded.into())).await?;
    Ok(())
}
