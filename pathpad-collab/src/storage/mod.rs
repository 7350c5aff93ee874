//! Persistent storage layer for path-addressed documents.
//!
//! Architecture:
//! ```text
//! ┌───────────────┐  get / upsert / setAccess   ┌─────────────────┐
//! │ AccessControl │ ──────────────────────────► │ DocumentStore   │
//! │ CollabService │                             │ (rules, mutex)  │
//! └───────────────┘                             └────────┬────────┘
//!                                                        │ load / save / scan
//!                                         ┌──────────────┴──────────────┐
//!                                         ▼                             ▼
//!                                ┌─────────────────┐          ┌─────────────────┐
//!                                │ RocksBackend    │          │ MemoryBackend   │
//!                                │ CF "documents"  │          │ BTreeMap        │
//!                                │ CF "visitors"   │          │ (tests, dev)    │
//!                                └─────────────────┘          └─────────────────┘
//! ```
//!
//! [`DocumentStore`] owns every rule of the persistence contract: lazy
//! creation, the 200 KiB limit, strictly increasing `updated_at`, flag-only
//! access updates, pageview counting and child listing. Backends only move
//! whole records. Each mutating call runs under one store-wide lock, so a
//! call is a single read-modify-write and two writes to the same path
//! commit in order.

pub mod memory;
pub mod rocks;

pub use memory::MemoryBackend;
pub use rocks::{RocksBackend, StoreConfig};

use parking_lot::Mutex;

use crate::clock::SharedClock;
use crate::credential::{CredentialError, CredentialHasher};
use crate::document::{is_immediate_child, oversized, Document, FormatType, MAX_DOCUMENT_BYTES};

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("document is {size} bytes, limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Record-level persistence. Implementations store whole documents and
/// visitor keys; they never interpret document fields.
pub trait StorageBackend: Send + Sync {
    fn load(&self, path: &str) -> Result<Option<Document>>;

    fn save(&self, doc: &Document) -> Result<()>;

    /// Persist `doc` and mark `visitor_key` as seen for its path, atomically.
    fn save_with_visitor(&self, doc: &Document, visitor_key: &str) -> Result<()>;

    fn has_visitor(&self, path: &str, visitor_key: &str) -> Result<bool>;

    /// Every document whose path starts with `prefix`, ordered by path.
    fn scan(&self, prefix: &str) -> Result<Vec<Document>>;
}

/// The persistence contract for documents.
pub struct DocumentStore {
    backend: Box<dyn StorageBackend>,
    clock: SharedClock,
    hasher: CredentialHasher,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl DocumentStore {
    pub fn new(backend: Box<dyn StorageBackend>, clock: SharedClock) -> Self {
        Self {
            backend,
            clock,
            hasher: CredentialHasher::default(),
            write_lock: Mutex::new(()),
        }
    }

    /// RocksDB-backed store at the configured path.
    pub fn open(config: StoreConfig, clock: SharedClock) -> Result<Self> {
        Ok(Self::new(Box::new(RocksBackend::open(config)?), clock))
    }

    /// Non-durable store.
    pub fn in_memory(clock: SharedClock) -> Self {
        Self::new(Box::new(MemoryBackend::new()), clock)
    }

    pub fn with_hasher(mut self, hasher: CredentialHasher) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub fn get(&self, path: &str) -> Result<Option<Document>> {
        self.backend.load(path)
    }

    /// Fetch the document, creating an empty one for an unseen path.
    pub fn get_or_create(&self, path: &str) -> Result<Document> {
        if let Some(doc) = self.backend.load(path)? {
            return Ok(doc);
        }
        let _guard = self.write_lock.lock();
        self.load_or_new(path, true)
    }

    /// False when the document is absent or has no password.
    pub fn verify_password(&self, path: &str, candidate: &str) -> Result<bool> {
        Ok(self
            .backend
            .load(path)?
            .and_then(|doc| doc.password_hash)
            .is_some_and(|hash| hash.verify(candidate)))
    }

    /// Documents exactly one segment below `prefix`, hiding blocked and
    /// read-protected ones.
    pub fn list_children(&self, prefix: &str) -> Result<Vec<Document>> {
        let scan_prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("{prefix}/")
        };
        Ok(self
            .backend
            .scan(&scan_prefix)?
            .into_iter()
            .filter(|doc| is_immediate_child(prefix, &doc.path))
            .filter(|doc| !doc.blocked && !doc.requires_read_password)
            .collect())
    }

    /// Every document, blocked ones included.
    pub fn list_all(&self) -> Result<Vec<Document>> {
        self.backend.scan("")
    }

    // ─── Writes ───────────────────────────────────────────────────────

    /// Write text (and optionally format). Oversized text is rejected with
    /// nothing changed.
    pub fn upsert(&self, path: &str, text: &str, format: Option<FormatType>) -> Result<Document> {
        if let Some(size) = oversized(text) {
            return Err(StoreError::PayloadTooLarge {
                size,
                limit: MAX_DOCUMENT_BYTES,
            });
        }
        let _guard = self.write_lock.lock();
        let mut doc = self.load_or_new(path, false)?;
        doc.apply_text(text.to_string(), format, self.clock.now_secs());
        self.backend.save(&doc)?;
        Ok(doc)
    }

    /// Replace the password (`None` clears it) and the write flag.
    pub fn set_password(
        &self,
        path: &str,
        password: Option<&str>,
        requires_write: bool,
    ) -> Result<Document> {
        let hash = password.map(|p| self.hasher.hash(p)).transpose()?;
        let _guard = self.write_lock.lock();
        let mut doc = self.load_or_new(path, false)?;
        doc.password_hash = hash;
        doc.set_flags(requires_write, doc.requires_read_password);
        self.backend.save(&doc)?;
        Ok(doc)
    }

    /// Update both flags. A `None` password leaves the stored hash alone.
    pub fn set_access(
        &self,
        path: &str,
        password: Option<&str>,
        requires_write: bool,
        requires_read: bool,
    ) -> Result<Document> {
        let hash = password.map(|p| self.hasher.hash(p)).transpose()?;
        let _guard = self.write_lock.lock();
        let mut doc = self.load_or_new(path, false)?;
        if let Some(hash) = hash {
            doc.password_hash = Some(hash);
        }
        doc.set_flags(requires_write, requires_read);
        self.backend.save(&doc)?;
        Ok(doc)
    }

    /// Set the password only if none exists yet. Returns whether this call
    /// installed it.
    pub fn claim_password(&self, path: &str, password: &str) -> Result<bool> {
        let hash = self.hasher.hash(password)?;
        let _guard = self.write_lock.lock();
        let mut doc = self.load_or_new(path, false)?;
        if doc.has_password() {
            return Ok(false);
        }
        doc.password_hash = Some(hash);
        doc.set_flags(true, doc.requires_read_password);
        self.backend.save(&doc)?;
        Ok(true)
    }

    /// Block a path, creating it if unseen.
    pub fn block(&self, path: &str, reason: Option<&str>) -> Result<Document> {
        let _guard = self.write_lock.lock();
        let mut doc = self.load_or_new(path, false)?;
        doc.blocked = true;
        doc.blocked_reason = reason.map(str::to_string);
        doc.blocked_at = Some(self.clock.now_secs());
        self.backend.save(&doc)?;
        log::info!("Blocked document {path}");
        Ok(doc)
    }

    /// Lift a block. Unseen paths stay unseen.
    pub fn unblock(&self, path: &str) -> Result<Option<Document>> {
        let _guard = self.write_lock.lock();
        let Some(mut doc) = self.backend.load(path)? else {
            return Ok(None);
        };
        doc.blocked = false;
        doc.blocked_reason = None;
        doc.blocked_at = None;
        self.backend.save(&doc)?;
        log::info!("Unblocked document {path}");
        Ok(Some(doc))
    }

    /// Count a view. A visitor key counts as unique once per path.
    pub fn record_pageview(&self, path: &str, visitor_key: &str) -> Result<Document> {
        let _guard = self.write_lock.lock();
        let mut doc = self.load_or_new(path, false)?;
        doc.total_pageviews += 1;
        if self.backend.has_visitor(path, visitor_key)? {
            self.backend.save(&doc)?;
        } else {
            doc.unique_pageviews += 1;
            self.backend.save_with_visitor(&doc, visitor_key)?;
        }
        Ok(doc)
    }

    /// Load under the write lock, or build a fresh record. `persist` saves
    /// the fresh record immediately.
    fn load_or_new(&self, path: &str, persist: bool) -> Result<Document> {
        if let Some(doc) = self.backend.load(path)? {
            return Ok(doc);
        }
        let doc = Document::new(path, self.clock.now_secs());
        if persist {
            self.backend.save(&doc)?;
            log::debug!("Created document {path}");
        }
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::document::HOME_PATH;
    use std::sync::Arc;
    use std::time::Duration;

    fn store_at(secs: u64) -> (DocumentStore, Arc<ManualClock>) {
        let clock = ManualClock::at_secs(secs);
        let store = DocumentStore::in_memory(clock.clone())
            .with_hasher(CredentialHasher::for_testing());
        (store, clock)
    }

    #[test]
    fn test_get_absent() {
        let (store, _) = store_at(100);
        assert!(store.get("nope").unwrap().is_none());
    }

    #[test]
    fn test_get_or_create_persists_defaults() {
        let (store, _) = store_at(100);
        let doc = store.get_or_create("fresh").unwrap();
        assert_eq!(doc.text, "");
        assert_eq!(doc.format_type, FormatType::Text);
        assert!(!doc.has_password());
        assert!(store.get("fresh").unwrap().is_some());
    }

    #[test]
    fn test_upsert_creates_then_updates() {
        let (store, clock) = store_at(100);
        let first = store.upsert("notes/a", "one", None).unwrap();
        assert_eq!(first.text, "one");
        clock.advance(Duration::from_secs(5));
        let second = store.upsert("notes/a", "two", Some(FormatType::Markdown)).unwrap();
        assert_eq!(second.text, "two");
        assert_eq!(second.format_type, FormatType::Markdown);
        assert_eq!(second.updated_at, 105);
        assert_eq!(second.created_at, first.created_at);
    }

    #[test]
    fn test_updated_at_strictly_increases_within_one_second() {
        let (store, _) = store_at(100);
        let mut last = store.get_or_create("fast").unwrap().updated_at;
        for i in 0..5 {
            let doc = store.upsert("fast", &format!("rev {i}"), None).unwrap();
            assert!(doc.updated_at > last);
            last = doc.updated_at;
        }
    }

    #[test]
    fn test_oversized_upsert_changes_nothing() {
        let (store, _) = store_at(100);
        let before = store.upsert("big", "small", None).unwrap();
        let huge = "x".repeat(MAX_DOCUMENT_BYTES + 1);
        let err = store.upsert("big", &huge, None).unwrap_err();
        assert!(matches!(err, StoreError::PayloadTooLarge { .. }));
        let after = store.get("big").unwrap().unwrap();
        assert_eq!(after.text, before.text);
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[test]
    fn test_oversized_upsert_does_not_create() {
        let (store, _) = store_at(100);
        let huge = "x".repeat(MAX_DOCUMENT_BYTES + 1);
        assert!(store.upsert("ghost", &huge, None).is_err());
        assert!(store.get("ghost").unwrap().is_none());
    }

    #[test]
    fn test_set_access_without_password_keeps_hash() {
        let (store, _) = store_at(100);
        store.set_access("d", Some("pw"), true, true).unwrap();
        let doc = store.set_access("d", None, false, true).unwrap();
        assert!(doc.has_password());
        assert!(!doc.requires_write_password);
        assert!(doc.requires_read_password);
        assert!(store.verify_password("d", "pw").unwrap());
    }

    #[test]
    fn test_set_password_none_clears() {
        let (store, _) = store_at(100);
        store.set_password("d", Some("pw"), true).unwrap();
        assert!(store.verify_password("d", "pw").unwrap());
        let doc = store.set_password("d", None, false).unwrap();
        assert!(!doc.has_password());
        assert!(!store.verify_password("d", "pw").unwrap());
    }

    #[test]
    fn test_verify_password_absent_or_unset() {
        let (store, _) = store_at(100);
        assert!(!store.verify_password("missing", "x").unwrap());
        store.get_or_create("open").unwrap();
        assert!(!store.verify_password("open", "").unwrap());
    }

    #[test]
    fn test_claim_password_once() {
        let (store, _) = store_at(100);
        assert!(store.claim_password(HOME_PATH, "abc123").unwrap());
        assert!(!store.claim_password(HOME_PATH, "other").unwrap());
        assert!(store.verify_password(HOME_PATH, "abc123").unwrap());
        assert!(!store.verify_password(HOME_PATH, "other").unwrap());
    }

    #[test]
    fn test_home_write_flag_survives_access_update() {
        let (store, _) = store_at(100);
        let doc = store.set_access(HOME_PATH, Some("pw"), false, false).unwrap();
        assert!(doc.requires_write_password);
    }

    #[test]
    fn test_pageviews_unique_and_total() {
        let (store, _) = store_at(100);
        store.record_pageview("p", "1.2.3.4").unwrap();
        store.record_pageview("p", "1.2.3.4").unwrap();
        let doc = store.record_pageview("p", "5.6.7.8").unwrap();
        assert_eq!(doc.unique_pageviews, 2);
        assert_eq!(doc.total_pageviews, 3);

        // Same visitor on another path is unique there
        let other = store.record_pageview("q", "1.2.3.4").unwrap();
        assert_eq!(other.unique_pageviews, 1);
    }

    #[test]
    fn test_pageview_does_not_bump_version() {
        let (store, clock) = store_at(100);
        let before = store.upsert("p", "text", None).unwrap();
        clock.advance(Duration::from_secs(30));
        let after = store.record_pageview("p", "v").unwrap();
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[test]
    fn test_block_unblock() {
        let (store, _) = store_at(100);
        let doc = store.block("spam", Some("abuse")).unwrap();
        assert!(doc.blocked);
        assert_eq!(doc.blocked_reason.as_deref(), Some("abuse"));
        assert_eq!(doc.blocked_at, Some(100));

        let doc = store.unblock("spam").unwrap().unwrap();
        assert!(!doc.blocked);
        assert!(doc.blocked_reason.is_none());
        assert!(doc.blocked_at.is_none());

        assert!(store.unblock("never-seen").unwrap().is_none());
        assert!(store.get("never-seen").unwrap().is_none());
    }

    #[test]
    fn test_list_children_filters() {
        let (store, _) = store_at(100);
        store.upsert("docs/a", "a", None).unwrap();
        store.upsert("docs/b", "b", None).unwrap();
        store.upsert("docs/b/deep", "deep", None).unwrap();
        store.upsert("docsx/c", "c", None).unwrap();
        store.upsert("docs", "root", None).unwrap();
        store.block("docs/blocked", None).unwrap();
        store.set_access("docs/private", Some("pw"), false, true).unwrap();

        let paths: Vec<String> = store
            .list_children("docs")
            .unwrap()
            .into_iter()
            .map(|d| d.path)
            .collect();
        assert_eq!(paths, vec!["docs/a".to_string(), "docs/b".to_string()]);
    }

    #[test]
    fn test_list_children_top_level() {
        let (store, _) = store_at(100);
        store.upsert("alpha", "a", None).unwrap();
        store.upsert("beta/child", "b", None).unwrap();
        let paths: Vec<String> = store
            .list_children("")
            .unwrap()
            .into_iter()
            .map(|d| d.path)
            .collect();
        assert_eq!(paths, vec!["alpha".to_string()]);
    }

    #[test]
    fn test_list_all_includes_blocked() {
        let (store, _) = store_at(100);
        store.upsert("a", "a", None).unwrap();
        store.block("b", Some("x")).unwrap();
        assert_eq!(store.list_all().unwrap().len(), 2);
    }
}
