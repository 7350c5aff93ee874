//! Read/write gate for documents.
//!
//! Two independent axes per document:
//!
//! ```text
//! write:  OPEN ──(requires_write ∧ password)──► PROTECTED    (home: always PROTECTED)
//! read:   OPEN ──(requires_read  ∧ password)──► LOCKED       (valid session bypasses)
//! ```
//!
//! Block state is checked before anything else and hides the document
//! entirely. A LOCKED read is not an error: it returns an empty body with
//! `locked = true` so the caller can offer an unlock prompt.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::credential::is_blank;
use crate::document::{oversized, Document, DocumentSnapshot, DocumentView, FormatType, MAX_DOCUMENT_BYTES};
use crate::session::{SessionGrant, SessionTokenManager};
use crate::storage::{DocumentStore, StoreError};

/// Typed outcomes of access checks.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AccessError {
    #[error("password required")]
    PasswordRequired,

    #[error("incorrect password")]
    IncorrectPassword,

    #[error("policy conflict: {0}")]
    PolicyConflict(String),

    #[error("document is blocked")]
    DocumentBlocked {
        reason: Option<String>,
        blocked_at: Option<u64>,
    },

    #[error("document is {size} bytes, limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("session expired or invalid")]
    SessionExpiredOrInvalid,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage failure: {0}")]
    Storage(StoreError),
}

impl From<StoreError> for AccessError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::PayloadTooLarge { size, limit } => AccessError::PayloadTooLarge { size, limit },
            other => AccessError::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, AccessError>;

/// Requested access configuration for a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessChange {
    /// New password; blank means "keep the current one"
    pub password: Option<String>,
    /// Proof of the current password
    pub current_password: Option<String>,
    pub requires_write: bool,
    pub requires_read: bool,
}

/// How a password rotation is authorized.
#[derive(Debug, Clone, Copy)]
pub enum Rotation<'a> {
    /// Caller proves the current password
    Verified(&'a str),
    /// Administrative override, no proof
    AdminOverride,
}

/// Knobs for policy edge cases.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    /// Require the current password for flag-only changes and removal
    /// on documents that already have one.
    pub require_current_password_for_policy_changes: bool,
}

/// Successful unlock.
#[derive(Debug, Clone)]
pub struct Unlocked {
    pub view: DocumentView,
    /// `None` when the document was not read-locked
    pub session: Option<SessionGrant>,
}

pub struct AccessController {
    store: Arc<DocumentStore>,
    sessions: Arc<SessionTokenManager>,
    policy: AccessPolicy,
}

impl AccessController {
    pub fn new(store: Arc<DocumentStore>, sessions: Arc<SessionTokenManager>) -> Self {
        Self::with_policy(store, sessions, AccessPolicy::default())
    }

    pub fn with_policy(
        store: Arc<DocumentStore>,
        sessions: Arc<SessionTokenManager>,
        policy: AccessPolicy,
    ) -> Self {
        Self {
            store,
            sessions,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn sessions(&self) -> &Arc<SessionTokenManager> {
        &self.sessions
    }

    // ─── Read axis ────────────────────────────────────────────────────

    /// Read `path` for `viewer_id`, creating it if unseen. LOCKED documents
    /// come back empty unless `token` is a live session for this viewer.
    pub fn read(&self, path: &str, viewer_id: &str, token: Option<&str>) -> Result<DocumentView> {
        let doc = self.store.get_or_create(path)?;
        ensure_not_blocked(&doc)?;
        let locked = !self.can_read(&doc, viewer_id, token);
        Ok(DocumentView::of(&doc, locked))
    }

    /// Whether the viewer may see the document's text.
    pub fn can_read(&self, doc: &Document, viewer_id: &str, token: Option<&str>) -> bool {
        !doc.read_locked()
            || token.is_some_and(|token| self.sessions.verify(&doc.path, viewer_id, token))
    }

    /// Check the read password and open a session for the viewer.
    pub fn unlock(&self, path: &str, viewer_id: &str, password: Option<&str>) -> Result<Unlocked> {
        let doc = self.store.get_or_create(path)?;
        ensure_not_blocked(&doc)?;

        if !doc.read_locked() {
            return Ok(Unlocked {
                view: DocumentView::of(&doc, false),
                session: None,
            });
        }
        let password = password.filter(|p| !p.trim().is_empty()).ok_or(AccessError::PasswordRequired)?;
        if !doc.password_hash.as_ref().is_some_and(|hash| hash.verify(password)) {
            log::warn!("Rejected unlock attempt on {path}");
            return Err(AccessError::IncorrectPassword);
        }

        let session = self.sessions.issue(path, viewer_id);
        Ok(Unlocked {
            view: DocumentView::of(&doc, false),
            session: Some(session),
        })
    }

    /// Fails with `SessionExpiredOrInvalid` unless the token is live.
    pub fn verify_session(&self, path: &str, viewer_id: &str, token: &str) -> Result<()> {
        if self.sessions.verify(path, viewer_id, token) {
            Ok(())
        } else {
            Err(AccessError::SessionExpiredOrInvalid)
        }
    }

    /// Explicit logout for one viewer.
    pub fn sign_out(&self, path: &str, viewer_id: &str) -> bool {
        self.sessions.invalidate_one(path, viewer_id)
    }

    /// The version of `snapshot` this viewer may receive: `None` if the
    /// document is blocked, text withheld if it is LOCKED for them.
    pub fn visible_snapshot(
        &self,
        snapshot: &DocumentSnapshot,
        viewer_id: &str,
        token: Option<&str>,
    ) -> Result<Option<DocumentSnapshot>> {
        let Some(doc) = self.store.get(&snapshot.path)? else {
            return Ok(None);
        };
        if doc.blocked {
            return Ok(None);
        }
        if self.can_read(&doc, viewer_id, token) {
            Ok(Some(snapshot.clone()))
        } else {
            Ok(Some(snapshot.redacted()))
        }
    }

    // ─── Write axis ───────────────────────────────────────────────────

    /// Gate a write. The first write to `home` installs the supplied
    /// password as part of the same check.
    pub fn authorize_write(&self, path: &str, password: Option<&str>) -> Result<()> {
        let doc = match self.store.get(path)? {
            Some(doc) => doc,
            None => Document::new(path, self.store.clock().now_secs()),
        };
        ensure_not_blocked(&doc)?;
        if !doc.write_protected() {
            return Ok(());
        }

        let password = password.filter(|p| !p.trim().is_empty()).ok_or(AccessError::PasswordRequired)?;
        if doc.is_home() && !doc.has_password() && self.store.claim_password(path, password)? {
            log::info!("Home password set by first write");
            return Ok(());
        }
        if self.store.verify_password(path, password)? {
            Ok(())
        } else {
            log::warn!("Rejected write with wrong password on {path}");
            Err(AccessError::IncorrectPassword)
        }
    }

    /// Gate and persist a write. Size is checked before the gate so an
    /// oversized first write to `home` does not claim its password.
    pub fn write(
        &self,
        path: &str,
        text: &str,
        password: Option<&str>,
        format: Option<FormatType>,
    ) -> Result<Document> {
        if let Some(size) = oversized(text) {
            return Err(AccessError::PayloadTooLarge {
                size,
                limit: MAX_DOCUMENT_BYTES,
            });
        }
        self.authorize_write(path, password)?;
        Ok(self.store.upsert(path, text, format)?)
    }

    // ─── Policy ───────────────────────────────────────────────────────

    /// Apply an access configuration change.
    ///
    /// - A new password needs at least one axis (home implies write) and,
    ///   if a password already exists, proof of it.
    /// - Without a new password, enabling an axis needs an existing password.
    /// - Without a new password and with no axis selected on a protected
    ///   document, protection is removed; the hash is kept.
    pub fn set_access(&self, path: &str, change: &AccessChange) -> Result<Document> {
        let doc = match self.store.get(path)? {
            Some(doc) => doc,
            None => Document::new(path, self.store.clock().now_secs()),
        };
        ensure_not_blocked(&doc)?;

        let new_password = change.password.as_deref().filter(|p| !p.trim().is_empty());
        let any_axis = change.requires_write || change.requires_read || doc.is_home();

        if !any_axis && (new_password.is_some() || !doc.has_password()) {
            return Err(AccessError::PolicyConflict(
                "select read and/or write protection".into(),
            ));
        }

        match new_password {
            Some(password) => {
                if doc.has_password() {
                    check_current(&doc, change.current_password.as_deref())?;
                }
                let updated = self.store.set_access(
                    path,
                    Some(password),
                    change.requires_write,
                    change.requires_read,
                )?;
                self.sessions.invalidate_all(path);
                log::info!("Password changed on {path}");
                Ok(updated)
            }
            None => {
                if !doc.has_password() {
                    return Err(AccessError::PasswordRequired);
                }
                if !is_blank(change.current_password.as_deref()) {
                    check_current(&doc, change.current_password.as_deref())?;
                } else if self.policy.require_current_password_for_policy_changes {
                    return Err(AccessError::PasswordRequired);
                }
                let updated =
                    self.store
                        .set_access(path, None, change.requires_write, change.requires_read)?;
                log::info!(
                    "Access flags on {path}: write={} read={}",
                    updated.requires_write_password,
                    updated.requires_read_password
                );
                Ok(updated)
            }
        }
    }

    /// Replace an existing password, keeping the document's flags. Every
    /// session for the path is revoked.
    pub fn rotate_password(&self, path: &str, new_password: &str, rotation: Rotation<'_>) -> Result<Document> {
        let doc = self
            .store
            .get(path)?
            .ok_or_else(|| AccessError::NotFound(path.to_string()))?;
        if !doc.has_password() {
            return Err(AccessError::PolicyConflict("document has no password".into()));
        }
        if is_blank(Some(new_password)) {
            return Err(AccessError::PasswordRequired);
        }
        match rotation {
            Rotation::Verified(current) => check_current(&doc, Some(current))?,
            Rotation::AdminOverride => log::info!("Administrative password override on {path}"),
        }

        let updated = self.store.set_access(
            path,
            Some(new_password),
            doc.requires_write_password,
            doc.requires_read_password,
        )?;
        self.sessions.invalidate_all(path);
        Ok(updated)
    }
}

fn ensure_not_blocked(doc: &Document) -> Result<()> {
    if doc.blocked {
        Err(AccessError::DocumentBlocked {
            reason: doc.blocked_reason.clone(),
            blocked_at: doc.blocked_at,
        })
    } else {
        Ok(())
    }
}

fn check_current(doc: &Document, current: Option<&str>) -> Result<()> {
    let current = current.filter(|p| !p.trim().is_empty()).ok_or(AccessError::PasswordRequired)?;
    if doc.password_hash.as_ref().is_some_and(|hash| hash.verify(current)) {
        Ok(())
    } else {
        Err(AccessError::IncorrectPassword)
    }
}
