//! Application facade tying the components together.
//!
//! ```text
//!                 ┌──────────────────┐
//!  SyncServer ──► │  CollabService   │
//!   (per conn)    └─┬──┬──┬──┬──┬────┘
//!                   │  │  │  │  └─► AdminAuth
//!                   │  │  │  └────► ChangeBroadcaster ──► sinks
//!                   │  │  └───────► PresenceTracker
//!                   │  └──────────► AccessController ──► SessionTokenManager
//!                   └─────────────► DocumentStore ─────► backend
//! ```
//!
//! Paths are normalized here, once, so every component below sees the
//! canonical form.

use std::sync::Arc;
use std::time::Duration;

use crate::access::{AccessChange, AccessController, AccessError, AccessPolicy, Rotation, Unlocked};
use crate::admin::{AdminAuth, AdminError};
use crate::broadcast::{BroadcastStats, ChangeBroadcaster, SnapshotReceiver, SnapshotSink, SubscriptionHandle};
use crate::clock::SharedClock;
use crate::document::{
    normalize_path, oversized, strip_markup, DocumentSnapshot, DocumentSummary, DocumentView,
    FormatType, HOME_PATH, MAX_DOCUMENT_BYTES,
};
use crate::presence::{PresenceTracker, PRESENCE_TTL};
use crate::session::{SessionConfig, SessionTokenManager};
use crate::storage::{DocumentStore, StoreError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Admin(#[from] AdminError),

    #[error("access worker failed: {0}")]
    Worker(String),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        ServiceError::Access(e.into())
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub session: SessionConfig,
    pub presence_ttl: Duration,
    pub access_policy: AccessPolicy,
    /// `None` disables administration
    pub admin_password: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            presence_ttl: PRESENCE_TTL,
            access_policy: AccessPolicy::default(),
            admin_password: None,
        }
    }
}

/// Outcome of a maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Maintenance {
    pub sessions_purged: usize,
    pub viewers_swept: usize,
}

pub struct CollabService {
    store: Arc<DocumentStore>,
    access: Arc<AccessController>,
    presence: PresenceTracker,
    broadcaster: ChangeBroadcaster,
    admin: AdminAuth,
}

impl CollabService {
    pub fn new(store: Arc<DocumentStore>, config: ServiceConfig) -> Self {
        let clock = store.clock().clone();
        let sessions = Arc::new(SessionTokenManager::from_config(&config.session, clock.clone()));
        Self {
            access: Arc::new(AccessController::with_policy(store.clone(), sessions, config.access_policy)),
            presence: PresenceTracker::with_ttl(clock.clone(), config.presence_ttl),
            broadcaster: ChangeBroadcaster::new(),
            admin: AdminAuth::new(config.admin_password, clock),
            store,
        }
    }

    /// Non-durable service, for tests and throwaway runs.
    pub fn in_memory(clock: SharedClock, config: ServiceConfig) -> Self {
        Self::new(Arc::new(DocumentStore::in_memory(clock)), config)
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn access(&self) -> &AccessController {
        &self.access
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn broadcaster(&self) -> &ChangeBroadcaster {
        &self.broadcaster
    }

    /// Run an access call that may hash a password on the blocking pool,
    /// keeping Argon2 off the async workers.
    async fn off_runtime<T, F>(&self, call: F) -> Result<T>
    where
        F: FnOnce(&AccessController) -> std::result::Result<T, AccessError> + Send + 'static,
        T: Send + 'static,
    {
        let access = self.access.clone();
        tokio::task::spawn_blocking(move || call(&access))
            .await
            .map_err(|e| ServiceError::Worker(e.to_string()))?
            .map_err(ServiceError::from)
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// Read a document for display, counting a pageview when a visitor
    /// key is given.
    pub fn open(
        &self,
        path: &str,
        viewer_id: &str,
        session_token: Option<&str>,
        visitor_key: Option<&str>,
    ) -> Result<DocumentView> {
        let path = normalize_path(path);
        let mut view = self.access.read(&path, viewer_id, session_token)?;
        if let Some(visitor) = visitor_key.filter(|v| !v.is_empty()) {
            let counted = self.store.record_pageview(&path, visitor)?;
            view.unique_pageviews = counted.unique_pageviews;
            view.total_pageviews = counted.total_pageviews;
        }
        Ok(view)
    }

    /// Persist submitted text and fan the change out to every subscriber.
    /// Returns the snapshot the saver should treat as confirmation.
    pub async fn save(
        &self,
        path: &str,
        text: &str,
        password: Option<&str>,
        format: Option<&str>,
    ) -> Result<DocumentSnapshot> {
        let path = normalize_path(path);
        if let Some(size) = oversized(text) {
            return Err(AccessError::PayloadTooLarge {
                size,
                limit: MAX_DOCUMENT_BYTES,
            }
            .into());
        }
        // Unknown names keep the stored format
        let format = format.and_then(|name| {
            let parsed = FormatType::parse(name);
            if parsed.is_none() && !name.trim().is_empty() {
                log::debug!("Ignoring unknown format {name:?} for {path}");
            }
            parsed
        });

        let text = strip_markup(text).into_owned();
        let password = password.map(str::to_owned);
        let doc = {
            let path = path.clone();
            self.off_runtime(move |access| access.write(&path, &text, password.as_deref(), format))
                .await?
        };
        let snapshot = doc.snapshot();
        let delivered = self.broadcaster.publish(&path, snapshot.clone()).await;
        log::debug!("Saved {path} at {} ({delivered} subscriber(s))", snapshot.updated_at);
        Ok(snapshot)
    }

    pub async fn unlock(&self, path: &str, viewer_id: &str, password: Option<&str>) -> Result<Unlocked> {
        let path = normalize_path(path);
        let viewer_id = viewer_id.to_owned();
        let password = password.map(str::to_owned);
        self.off_runtime(move |access| access.unlock(&path, &viewer_id, password.as_deref()))
            .await
    }

    pub fn sign_out(&self, path: &str, viewer_id: &str) -> bool {
        self.access.sign_out(&normalize_path(path), viewer_id)
    }

    pub async fn set_access(&self, path: &str, change: &AccessChange) -> Result<DocumentSummary> {
        let path = normalize_path(path);
        let change = change.clone();
        self.off_runtime(move |access| access.set_access(&path, &change).map(|doc| doc.summary()))
            .await
    }

    /// Listed children of `path`. The home page lists top-level documents.
    pub fn related(&self, path: &str) -> Result<Vec<DocumentSummary>> {
        let path = normalize_path(path);
        let prefix = if path == HOME_PATH { "" } else { path.as_str() };
        Ok(self
            .store
            .list_children(prefix)?
            .iter()
            .filter(|doc| doc.path != HOME_PATH)
            .map(|doc| doc.summary())
            .collect())
    }

    /// Current snapshot if newer than `since`. Poll-mode counterpart of a
    /// push subscription; a locked document without a live session comes
    /// back redacted, like a pushed update.
    pub fn poll(
        &self,
        path: &str,
        viewer_id: &str,
        session_token: Option<&str>,
        since: u64,
    ) -> Result<Option<DocumentSnapshot>> {
        let path = normalize_path(path);
        let Some(doc) = self.store.get(&path)? else {
            return Ok(None);
        };
        if doc.blocked {
            return Err(AccessError::DocumentBlocked {
                reason: doc.blocked_reason,
                blocked_at: doc.blocked_at,
            }
            .into());
        }
        if doc.updated_at <= since {
            return Ok(None);
        }
        let snapshot = doc.snapshot();
        if self.access.can_read(&doc, viewer_id, session_token) {
            Ok(Some(snapshot))
        } else {
            Ok(Some(snapshot.redacted()))
        }
    }

    // ─── Subscriptions ────────────────────────────────────────────────

    pub async fn subscribe(&self, path: &str) -> (SubscriptionHandle, SnapshotReceiver) {
        self.broadcaster.subscribe_latest(&normalize_path(path)).await
    }

    pub async fn subscribe_sink(&self, path: &str, sink: Arc<dyn SnapshotSink>) -> SubscriptionHandle {
        self.broadcaster.subscribe(&normalize_path(path), sink).await
    }

    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.broadcaster.unsubscribe(handle).await
    }

    /// What a given viewer may see of a pushed snapshot.
    pub fn visible_snapshot(
        &self,
        snapshot: &DocumentSnapshot,
        viewer_id: &str,
        session_token: Option<&str>,
    ) -> Result<Option<DocumentSnapshot>> {
        Ok(self.access.visible_snapshot(snapshot, viewer_id, session_token)?)
    }

    // ─── Presence ─────────────────────────────────────────────────────

    pub fn heartbeat(&self, path: &str, viewer_id: &str) -> usize {
        self.presence.heartbeat(&normalize_path(path), viewer_id)
    }

    pub fn leave(&self, path: &str, viewer_id: &str) -> usize {
        self.presence.leave(&normalize_path(path), viewer_id)
    }

    pub fn active_viewers(&self, path: &str) -> usize {
        self.presence.count(&normalize_path(path))
    }

    // ─── Administration ───────────────────────────────────────────────

    pub fn admin_login(&self, password: &str) -> Result<String> {
        Ok(self.admin.login(password)?)
    }

    pub fn admin_logout(&self, token: &str) -> Result<()> {
        self.admin.verify(token)?;
        self.admin.logout(token);
        Ok(())
    }

    pub fn admin_list(&self, token: &str) -> Result<Vec<DocumentSummary>> {
        self.admin.verify(token)?;
        Ok(self.store.list_all()?.iter().map(|doc| doc.summary()).collect())
    }

    pub fn admin_block(&self, token: &str, path: &str, reason: Option<&str>) -> Result<DocumentSummary> {
        self.admin.verify(token)?;
        let reason = reason.map(str::trim).filter(|r| !r.is_empty());
        Ok(self.store.block(&normalize_path(path), reason)?.summary())
    }

    /// `None` when the path was never seen.
    pub fn admin_unblock(&self, token: &str, path: &str) -> Result<Option<DocumentSummary>> {
        self.admin.verify(token)?;
        Ok(self.store.unblock(&normalize_path(path))?.map(|doc| doc.summary()))
    }

    pub async fn admin_change_password(
        &self,
        token: &str,
        path: &str,
        current_password: &str,
        new_password: &str,
    ) -> Result<DocumentSummary> {
        self.admin.verify(token)?;
        let path = normalize_path(path);
        let current = current_password.to_owned();
        let new_password = new_password.to_owned();
        self.off_runtime(move |access| {
            access
                .rotate_password(&path, &new_password, Rotation::Verified(&current))
                .map(|doc| doc.summary())
        })
        .await
    }

    pub async fn admin_override_password(
        &self,
        token: &str,
        path: &str,
        new_password: &str,
    ) -> Result<DocumentSummary> {
        self.admin.verify(token)?;
        let path = normalize_path(path);
        let new_password = new_password.to_owned();
        self.off_runtime(move |access| {
            access
                .rotate_password(&path, &new_password, Rotation::AdminOverride)
                .map(|doc| doc.summary())
        })
        .await
    }

    // ─── Maintenance ──────────────────────────────────────────────────

    /// Drop expired sessions and stale presence records.
    pub fn purge_expired(&self) -> Maintenance {
        let report = Maintenance {
            sessions_purged: self.access.sessions().purge_expired(),
            viewers_swept: self.presence.sweep_all(),
        };
        if report != Maintenance::default() {
            log::debug!(
                "Maintenance purged {} session(s), {} viewer(s)",
                report.sessions_purged,
                report.viewers_swept
            );
        }
        report
    }

    pub async fn stats(&self) -> BroadcastStats {
        self.broadcaster.stats().await
    }
}
