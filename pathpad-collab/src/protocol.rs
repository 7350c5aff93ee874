//! Binary wire protocol between editors and the server.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded
//! [`ClientMessage`] or [`ServerMessage`]. Requests are answered in order on
//! the same connection; [`ServerMessage::Updated`] and
//! [`ServerMessage::Heartbeat`] are pushed unsolicited and may interleave
//! with responses.
//!
//! ```text
//! client                                   server
//!   │── Load{path, viewer_id, token} ───────►│  subscribes the connection
//!   │◄──────────────── Loaded(view) ─────────│
//!   │── Save{path, text, password} ─────────►│
//!   │◄──────────────── Saved(snapshot) ──────│
//!   │◄──────────────── Updated(snapshot) ────│  every subscriber, saver included
//!   │◄──────────────── Heartbeat{at} ────────│  every 30s
//! ```
//!
//! Performance target: Save encode < 2µs for a 1 KiB document.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::access::{AccessChange, AccessError};
use crate::document::{DocumentSnapshot, DocumentSummary, DocumentView};
use crate::session::SessionGrant;

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Read the document and subscribe this connection to its changes.
    Load {
        path: String,
        viewer_id: String,
        session_token: Option<String>,
        /// Pageview identity (hashed address or similar); none skips counting
        visitor_key: Option<String>,
    },
    Save {
        path: String,
        text: String,
        password: Option<String>,
        format: Option<String>,
    },
    Unlock {
        path: String,
        viewer_id: String,
        password: Option<String>,
    },
    SignOut {
        path: String,
        viewer_id: String,
    },
    SetAccess {
        path: String,
        change: AccessChange,
    },
    Related {
        path: String,
    },
    Heartbeat {
        path: String,
        viewer_id: String,
    },
    Leave {
        path: String,
        viewer_id: String,
    },
    Poll {
        path: String,
        viewer_id: String,
        session_token: Option<String>,
        since: u64,
    },
    Ping,
    AdminLogin {
        password: String,
    },
    Admin {
        token: String,
        op: AdminOp,
    },
}

/// Administrative operations; each needs a live admin token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminOp {
    ListDocuments,
    Block {
        path: String,
        reason: Option<String>,
    },
    Unblock {
        path: String,
    },
    ChangePassword {
        path: String,
        current_password: String,
        new_password: String,
    },
    OverridePassword {
        path: String,
        new_password: String,
    },
    Logout,
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Loaded(DocumentView),
    /// Pushed change; text is empty if the document is locked for this viewer
    Updated(DocumentSnapshot),
    /// Acknowledges this connection's own save
    Saved(DocumentSnapshot),
    Unlocked {
        view: DocumentView,
        session: Option<SessionGrant>,
    },
    SignedOut {
        path: String,
    },
    AccessUpdated(DocumentSummary),
    Related {
        path: String,
        children: Vec<DocumentSummary>,
    },
    ActiveViewers {
        path: String,
        count: usize,
    },
    PollResult {
        path: String,
        snapshot: Option<DocumentSnapshot>,
    },
    Blocked {
        path: String,
        reason: Option<String>,
        blocked_at: Option<u64>,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    /// Keep-alive on push connections (unix seconds)
    Heartbeat {
        at: u64,
    },
    Pong,
    AdminToken {
        token: String,
    },
    AdminDocuments(Vec<DocumentSummary>),
    AdminUpdated(Option<DocumentSummary>),
    AdminLoggedOut,
}

/// Error categories clients branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    PasswordRequired,
    IncorrectPassword,
    PolicyConflict,
    DocumentBlocked,
    PayloadTooLarge,
    SessionExpiredOrInvalid,
    NotFound,
    Unauthorized,
    BadRequest,
    Internal,
}

impl From<&AccessError> for ErrorKind {
    fn from(e: &AccessError) -> Self {
        match e {
            AccessError::PasswordRequired => ErrorKind::PasswordRequired,
            AccessError::IncorrectPassword => ErrorKind::IncorrectPassword,
            AccessError::PolicyConflict(_) => ErrorKind::PolicyConflict,
            AccessError::DocumentBlocked { .. } => ErrorKind::DocumentBlocked,
            AccessError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            AccessError::SessionExpiredOrInvalid => ErrorKind::SessionExpiredOrInvalid,
            AccessError::NotFound(_) => ErrorKind::NotFound,
            AccessError::Storage(_) => ErrorKind::Internal,
        }
    }
}

impl ServerMessage {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    /// Path of a pushed change, if this is one.
    pub fn updated_path(&self) -> Option<&str> {
        match self {
            Self::Updated(snapshot) => Some(&snapshot.path),
            _ => None,
        }
    }
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(msg)
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    Timeout,
}
