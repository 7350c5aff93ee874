//! WebSocket client for the document server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Typed request helpers for every [`ClientMessage`]
//! - An event channel carrying every [`ServerMessage`], pushes included
//! - An optional presence heartbeat loop (every 15s by default)
//!
//! Pair it with a [`SaveReconciler`](crate::reconciler::SaveReconciler) to
//! drive an editor: feed `Loaded`, `Saved`, `Updated` and `Error` events
//! into the reconciler and send its `Submit` actions with [`SyncClient::save`].

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::access::AccessChange;
use crate::presence::HEARTBEAT_INTERVAL;
use crate::protocol::{AdminOp, ClientMessage, ProtocolError, ServerMessage};
use crate::reconciler::SaveRequest;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Any frame from the server
    Server(ServerMessage),
}

/// The sync client.
pub struct SyncClient {
    /// Our viewer identity, stable for the client's lifetime
    viewer_id: String,

    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SyncEvent>,

    heartbeat_task: Option<(String, JoinHandle<()>)>,

    server_url: String,
}

impl SyncClient {
    pub fn new(viewer_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            viewer_id: viewer_id.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            heartbeat_task: None,
            server_url: server_url.into(),
        }
    }

    /// Client with a fresh random viewer id.
    pub fn anonymous(server_url: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), server_url)
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::Connection(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: decode frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(server_msg) => {
                            if event_tx.send(SyncEvent::Server(server_msg)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Stop the heartbeat loop and close the connection.
    pub async fn disconnect(&mut self) {
        self.stop_heartbeat().await;
        // Writer task sends Close once its channel is dropped
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Send any request.
    pub async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        let encoded = msg.encode()?;
        tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    // ─── Requests ─────────────────────────────────────────────────────

    /// Read `path` and subscribe this connection to its changes.
    pub async fn load(
        &self,
        path: &str,
        session_token: Option<&str>,
        visitor_key: Option<&str>,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Load {
            path: path.to_string(),
            viewer_id: self.viewer_id.clone(),
            session_token: session_token.map(str::to_string),
            visitor_key: visitor_key.map(str::to_string),
        })
        .await
    }

    pub async fn save(&self, request: &SaveRequest) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Save {
            path: request.path.clone(),
            text: request.text.clone(),
            password: request.password.clone(),
            format: request.format.map(|f| f.as_str().to_string()),
        })
        .await
    }

    pub async fn unlock(&self, path: &str, password: Option<&str>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Unlock {
            path: path.to_string(),
            viewer_id: self.viewer_id.clone(),
            password: password.map(str::to_string),
        })
        .await
    }

    pub async fn sign_out(&self, path: &str) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::SignOut {
            path: path.to_string(),
            viewer_id: self.viewer_id.clone(),
        })
        .await
    }

    pub async fn set_access(&self, path: &str, change: AccessChange) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::SetAccess {
            path: path.to_string(),
            change,
        })
        .await
    }

    pub async fn related(&self, path: &str) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Related { path: path.to_string() }).await
    }

    pub async fn heartbeat(&self, path: &str) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Heartbeat {
            path: path.to_string(),
            viewer_id: self.viewer_id.clone(),
        })
        .await
    }

    pub async fn leave(&self, path: &str) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Leave {
            path: path.to_string(),
            viewer_id: self.viewer_id.clone(),
        })
        .await
    }

    pub async fn poll(&self, path: &str, session_token: Option<&str>, since: u64) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Poll {
            path: path.to_string(),
            viewer_id: self.viewer_id.clone(),
            session_token: session_token.map(str::to_string),
            since,
        })
        .await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Ping).await
    }

    pub async fn admin_login(&self, password: &str) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::AdminLogin {
            password: password.to_string(),
        })
        .await
    }

    pub async fn admin(&self, token: &str, op: AdminOp) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Admin {
            token: token.to_string(),
            op,
        })
        .await
    }

    // ─── Presence loop ────────────────────────────────────────────────

    /// Beat for `path` now and every [`HEARTBEAT_INTERVAL`] until stopped.
    pub fn start_heartbeat(&mut self, path: &str) -> Result<(), ProtocolError> {
        self.start_heartbeat_every(path, HEARTBEAT_INTERVAL)
    }

    pub fn start_heartbeat_every(&mut self, path: &str, every: Duration) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.clone().ok_or(ProtocolError::ConnectionClosed)?;
        let beat = ClientMessage::Heartbeat {
            path: path.to_string(),
            viewer_id: self.viewer_id.clone(),
        }
        .encode()?;

        if let Some((_, previous)) = self.heartbeat_task.take() {
            previous.abort();
        }
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if tx.send(beat.clone()).await.is_err() {
                    break;
                }
            }
        });
        self.heartbeat_task = Some((path.to_string(), task));
        Ok(())
    }

    /// Stop beating and tell the server we left.
    pub async fn stop_heartbeat(&mut self) {
        if let Some((path, task)) = self.heartbeat_task.take() {
            task.abort();
            let _ = self.leave(&path).await;
        }
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = SyncClient::new("viewer-1", "ws://localhost:9090");
        assert_eq!(client.viewer_id(), "viewer-1");
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[test]
    fn test_anonymous_viewer_ids_differ() {
        let a = SyncClient::anonymous("ws://localhost:9090");
        let b = SyncClient::anonymous("ws://localhost:9090");
        assert_ne!(a.viewer_id(), b.viewer_id());
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new("v", "ws://localhost:9090");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let mut client = SyncClient::new("v", "ws://localhost:9090");
        assert!(matches!(
            client.send_ping().await,
            Err(ProtocolError::ConnectionClosed)
        ));
        assert!(client.start_heartbeat("p").is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = SyncClient::new("v", format!("ws://{addr}"));
        assert!(matches!(
            client.connect().await,
            Err(ProtocolError::Connection(_))
        ));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new("v", "ws://localhost:9090");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
