//! Shared harness for the WebSocket integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use pathpad_collab::client::{SyncClient, SyncEvent};
use pathpad_collab::clock::ManualClock;
use pathpad_collab::credential::CredentialHasher;
use pathpad_collab::document::DocumentSnapshot;
use pathpad_collab::protocol::ServerMessage;
use pathpad_collab::server::{ServerConfig, SyncServer};
use pathpad_collab::service::CollabService;
use pathpad_collab::storage::DocumentStore;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

pub const ADMIN_PASSWORD: &str = "root";
pub const START_SECS: u64 = 1_700_000_000;

pub struct TestServer {
    pub url: String,
    pub service: Arc<CollabService>,
    pub clock: Arc<ManualClock>,
}

/// In-memory server on a free port with a manual clock.
pub async fn start_test_server() -> TestServer {
    start_test_server_with(ServerConfig::default()).await
}

pub async fn start_test_server_with(config: ServerConfig) -> TestServer {
    let clock = ManualClock::at_secs(START_SECS);
    let store = DocumentStore::in_memory(clock.clone()).with_hasher(CredentialHasher::for_testing());
    let config = ServerConfig {
        admin_password: Some(ADMIN_PASSWORD.into()),
        ..config
    };
    let service = Arc::new(CollabService::new(Arc::new(store), config.service_config()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = SyncServer::with_service(config, service.clone());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    TestServer { url, service, clock }
}

/// Event stream that lets a test wait for one kind of frame without
/// losing the others.
pub struct Inbox {
    events: mpsc::Receiver<SyncEvent>,
    stash: VecDeque<ServerMessage>,
}

impl Inbox {
    pub fn new(events: mpsc::Receiver<SyncEvent>) -> Self {
        Self {
            events,
            stash: VecDeque::new(),
        }
    }

    /// First frame (stashed or new) accepted by `pick`.
    pub async fn next_matching<T>(&mut self, mut pick: impl FnMut(&ServerMessage) -> Option<T>) -> T {
        if let Some(pos) = self.stash.iter().position(|msg| pick(msg).is_some()) {
            let msg = self.stash.remove(pos).unwrap();
            return pick(&msg).unwrap();
        }
        loop {
            let event = timeout(Duration::from_secs(3), self.events.recv())
                .await
                .expect("timed out waiting for server frame")
                .expect("event channel closed");
            if let SyncEvent::Server(msg) = event {
                if let Some(found) = pick(&msg) {
                    return found;
                }
                self.stash.push_back(msg);
            }
        }
    }

    /// Next request/response frame, skipping pushes.
    pub async fn reply(&mut self) -> ServerMessage {
        self.next_matching(|msg| match msg {
            ServerMessage::Updated(_) | ServerMessage::Heartbeat { .. } => None,
            other => Some(other.clone()),
        })
        .await
    }

    /// Next pushed change.
    pub async fn update(&mut self) -> DocumentSnapshot {
        self.next_matching(|msg| match msg {
            ServerMessage::Updated(snapshot) => Some(snapshot.clone()),
            _ => None,
        })
        .await
    }

    /// Pushed changes only, without blocking past `wait`.
    pub async fn try_update(&mut self, wait: Duration) -> Option<DocumentSnapshot> {
        timeout(wait, self.update()).await.ok()
    }
}

/// Connected client and its inbox.
pub async fn connect(url: &str) -> (SyncClient, Inbox) {
    let mut client = SyncClient::anonymous(url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    assert_eq!(events.recv().await, Some(SyncEvent::Connected));
    (client, Inbox::new(events))
}
