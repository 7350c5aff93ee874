//! # pathpad-collab — path-addressed collaborative notepad
//!
//! Every URL path names one plain-text document. Anyone may read and write
//! an open document; a shared password can protect writing, reading or
//! both. Concurrent editors converge by last-write-wins on `updated_at`.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient           │ ◄─────────────────► │ SyncServer  │
//! │ + SaveReconciler     │     Binary Proto    │ (per conn)  │
//! └──────────────────────┘                     └──────┬──────┘
//!                                                     ▼
//!                                             ┌───────────────┐
//!                                             │ CollabService │
//!                                             └───┬───┬───┬───┘
//!                        AccessController ◄──────┘   │   └──────► ChangeBroadcaster
//!                        SessionTokenManager         │            (fan-out)
//!                                                    ▼
//!                                  DocumentStore ──► RocksDB / memory
//! ```
//!
//! ## Modules
//!
//! - [`document`] — Document model, path rules, size limit
//! - [`storage`] — DocumentStore over RocksDB or memory
//! - [`access`] — Read/write gate and password policy
//! - [`session`] — Read-unlock bypass tokens
//! - [`presence`] — Heartbeat-based active viewer counts
//! - [`broadcast`] — Path-keyed change fan-out
//! - [`reconciler`] — Client-side save/confirm state machine
//! - [`service`] — Facade used by the server
//! - [`protocol`] — Binary wire protocol (bincode-encoded messages)
//! - [`server`] / [`client`] — WebSocket transport
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Save encode (1 KiB) | <2µs |
//! | Publish 1K snapshots × 100 subscribers | <10ms |
//! | Store upsert (memory) | <20µs |

pub mod access;
pub mod admin;
pub mod broadcast;
pub mod client;
pub mod clock;
pub mod credential;
pub mod document;
pub mod presence;
pub mod protocol;
pub mod reconciler;
pub mod server;
pub mod service;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use access::{AccessChange, AccessController, AccessError, AccessPolicy, Rotation, Unlocked};
pub use admin::{AdminAuth, AdminError};
pub use broadcast::{
    BroadcastStats, ChangeBroadcaster, Delivery, LatestSnapshotSink, SnapshotReceiver, SnapshotSink,
    SubscriptionHandle,
};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use document::{
    Document, DocumentSnapshot, DocumentSummary, DocumentView, FormatType, HOME_PATH, MAX_DOCUMENT_BYTES,
};
pub use presence::{PresenceTracker, HEARTBEAT_INTERVAL, PRESENCE_TTL};
pub use protocol::{AdminOp, ClientMessage, ErrorKind, ProtocolError, ServerMessage};
pub use reconciler::{
    PasswordPrompt, ReconcilerAction, ReconcilerConfig, SaveReconciler, SaveRequest, SaveState, SaveStatus,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use service::{CollabService, Maintenance, ServiceConfig, ServiceError};
pub use session::{SessionConfig, SessionGrant, SessionTokenManager, SESSION_TTL};
pub use storage::{DocumentStore, MemoryBackend, RocksBackend, StorageBackend, StoreConfig, StoreError};
