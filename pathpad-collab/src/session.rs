//! Read-unlock session tokens.
//!
//! A token lets one viewer skip the read password of one path until it
//! expires (30 days), the viewer signs out, or the path's password changes.
//! Tokens live only in this process; after a restart every viewer simply
//! unlocks again.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::clock::SharedClock;

/// Default session lifetime.
pub const SESSION_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { ttl: SESSION_TTL }
    }
}

/// Random bytes per token (hex-encoded on the wire).
const TOKEN_BYTES: usize = 32;

/// Generate a hex bearer secret from the OS RNG.
pub(crate) fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Constant-time comparison for bearer secrets and shared passwords.
pub(crate) fn secrets_match(expected: &str, candidate: &str) -> bool {
    expected.as_bytes().ct_eq(candidate.as_bytes()).into()
}

#[derive(Debug, Clone)]
struct SessionRecord {
    token: String,
    created_at: u64,
    expires_at: u64,
}

/// Issued session, as returned to the unlocking viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionGrant {
    pub token: String,
    pub created_at: u64,
    pub expires_at: u64,
}

/// Owns every outstanding session, keyed by `(path, viewer_id)`.
pub struct SessionTokenManager {
    sessions: Mutex<HashMap<(String, String), SessionRecord>>,
    clock: SharedClock,
    ttl: Duration,
}

impl SessionTokenManager {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_ttl(clock, SESSION_TTL)
    }

    pub fn from_config(config: &SessionConfig, clock: SharedClock) -> Self {
        Self::with_ttl(clock, config.ttl)
    }

    pub fn with_ttl(clock: SharedClock, ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            clock,
            ttl,
        }
    }

    /// Issue (or re-issue) the viewer's token for `path`. Call only after
    /// the read password has been verified.
    pub fn issue(&self, path: &str, viewer_id: &str) -> SessionGrant {
        let now = self.clock.now_millis();
        let record = SessionRecord {
            token: random_token(),
            created_at: now,
            expires_at: now.saturating_add(self.ttl.as_millis() as u64),
        };
        let grant = SessionGrant {
            token: record.token.clone(),
            created_at: record.created_at,
            expires_at: record.expires_at,
        };
        self.sessions
            .lock()
            .insert((path.to_string(), viewer_id.to_string()), record);
        log::debug!("Issued session for viewer {viewer_id} on {path}");
        grant
    }

    /// True iff an unexpired session for `(path, viewer_id)` carries `token`.
    pub fn verify(&self, path: &str, viewer_id: &str, token: &str) -> bool {
        let now = self.clock.now_millis();
        let sessions = self.sessions.lock();
        sessions
            .get(&(path.to_string(), viewer_id.to_string()))
            .is_some_and(|record| record.expires_at > now && secrets_match(&record.token, token))
    }

    /// Drop every session for `path`. Returns how many were removed.
    pub fn invalidate_all(&self, path: &str) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|(p, _), _| p != path);
        let removed = before - sessions.len();
        if removed > 0 {
            log::info!("Invalidated {removed} session(s) for {path}");
        }
        removed
    }

    /// Sign one viewer out. Returns whether a session existed.
    pub fn invalidate_one(&self, path: &str, viewer_id: &str) -> bool {
        self.sessions
            .lock()
            .remove(&(path.to_string(), viewer_id.to_string()))
            .is_some()
    }

    /// Remove expired sessions. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, record| record.expires_at > now);
        before - sessions.len()
    }

    /// Outstanding sessions, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_issue_and_verify() {
        let clock = ManualClock::at_secs(1_000);
        let sessions = SessionTokenManager::new(clock.clone());
        let grant = sessions.issue("docs/readme", "viewer-1");
        assert_eq!(grant.token.len(), TOKEN_BYTES * 2);
        assert!(sessions.verify("docs/readme", "viewer-1", &grant.token));
        assert!(!sessions.verify("docs/readme", "viewer-2", &grant.token));
        assert!(!sessions.verify("docs/other", "viewer-1", &grant.token));
        assert!(!sessions.verify("docs/readme", "viewer-1", "forged"));
    }

    #[test]
    fn test_token_expires_after_thirty_days() {
        let clock = ManualClock::at_secs(1_000);
        let sessions = SessionTokenManager::new(clock.clone());
        let grant = sessions.issue("p", "v");
        assert_eq!(grant.expires_at - grant.created_at, SESSION_TTL.as_millis() as u64);

        clock.advance(SESSION_TTL - Duration::from_secs(1));
        assert!(sessions.verify("p", "v", &grant.token));
        clock.advance(Duration::from_secs(1));
        assert!(!sessions.verify("p", "v", &grant.token));
    }

    #[test]
    fn test_reissue_replaces_token() {
        let clock = ManualClock::at_secs(1_000);
        let sessions = SessionTokenManager::new(clock);
        let first = sessions.issue("p", "v");
        let second = sessions.issue("p", "v");
        assert_ne!(first.token, second.token);
        assert!(!sessions.verify("p", "v", &first.token));
        assert!(sessions.verify("p", "v", &second.token));
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn test_invalidate_all_only_touches_path() {
        let clock = ManualClock::at_secs(1_000);
        let sessions = SessionTokenManager::new(clock);
        let a = sessions.issue("p", "v1");
        let b = sessions.issue("p", "v2");
        let c = sessions.issue("q", "v1");
        assert_eq!(sessions.invalidate_all("p"), 2);
        assert!(!sessions.verify("p", "v1", &a.token));
        assert!(!sessions.verify("p", "v2", &b.token));
        assert!(sessions.verify("q", "v1", &c.token));
    }

    #[test]
    fn test_invalidate_one() {
        let clock = ManualClock::at_secs(1_000);
        let sessions = SessionTokenManager::new(clock);
        let a = sessions.issue("p", "v1");
        let b = sessions.issue("p", "v2");
        assert!(sessions.invalidate_one("p", "v1"));
        assert!(!sessions.invalidate_one("p", "v1"));
        assert!(!sessions.verify("p", "v1", &a.token));
        assert!(sessions.verify("p", "v2", &b.token));
    }

    #[test]
    fn test_secrets_match() {
        assert!(secrets_match("abc123", "abc123"));
        assert!(!secrets_match("abc123", "abc124"));
        assert!(!secrets_match("abc123", "abc12"));
        assert!(!secrets_match("abc123", ""));
    }

    #[test]
    fn test_verify_rejects_token_prefix() {
        let clock = ManualClock::at_secs(1_000);
        let sessions = SessionTokenManager::new(clock);
        let grant = sessions.issue("p", "v");
        assert!(!sessions.verify("p", "v", &grant.token[..grant.token.len() - 1]));
        assert!(!sessions.verify("p", "v", &format!("{}0", grant.token)));
    }

    #[test]
    fn test_purge_expired() {
        let clock = ManualClock::at_secs(1_000);
        let sessions = SessionTokenManager::with_ttl(clock.clone(), Duration::from_secs(60));
        sessions.issue("p", "old");
        clock.advance(Duration::from_secs(30));
        sessions.issue("p", "new");
        clock.advance(Duration::from_secs(31));
        assert_eq!(sessions.purge_expired(), 1);
        assert_eq!(sessions.len(), 1);
    }
}
