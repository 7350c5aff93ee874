//! Live viewer counts per path.
//!
//! Browsers cannot be trusted to say goodbye (backgrounded tabs, crashes,
//! dropped networks), so membership is time-based: a viewer is active while
//! its last heartbeat is younger than the TTL. Clients beat every 15s and
//! the TTL is 45s, so one or two missed beats never flap the count.
//!
//! Stale records are swept lazily. Every call sweeps the path it touches;
//! a global sweep piggybacks on calls at most once per TTL.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::SharedClock;

/// Client heartbeat cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Inactivity after which a viewer stops counting.
pub const PRESENCE_TTL: Duration = Duration::from_secs(45);

#[derive(Default)]
struct PresenceState {
    /// path → viewer_id → last_seen (ms)
    paths: HashMap<String, HashMap<String, u64>>,
    last_global_sweep: u64,
}

impl PresenceState {
    fn sweep_path(&mut self, path: &str, cutoff: u64) {
        if let Some(viewers) = self.paths.get_mut(path) {
            viewers.retain(|_, last_seen| *last_seen > cutoff);
            if viewers.is_empty() {
                self.paths.remove(path);
            }
        }
    }

    fn sweep_all(&mut self, cutoff: u64) -> usize {
        let mut removed = 0;
        self.paths.retain(|_, viewers| {
            let before = viewers.len();
            viewers.retain(|_, last_seen| *last_seen > cutoff);
            removed += before - viewers.len();
            !viewers.is_empty()
        });
        removed
    }

    fn count(&self, path: &str) -> usize {
        self.paths.get(path).map_or(0, HashMap::len)
    }
}

/// Ephemeral presence registry.
pub struct PresenceTracker {
    state: Mutex<PresenceState>,
    clock: SharedClock,
    ttl: Duration,
}

impl PresenceTracker {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_ttl(clock, PRESENCE_TTL)
    }

    pub fn with_ttl(clock: SharedClock, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(PresenceState::default()),
            clock,
            ttl,
        }
    }

    /// Mark the viewer as seen now and return the active count for `path`.
    pub fn heartbeat(&self, path: &str, viewer_id: &str) -> usize {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        self.sweep(&mut state, path, now);
        state
            .paths
            .entry(path.to_string())
            .or_default()
            .insert(viewer_id.to_string(), now);
        state.count(path)
    }

    /// Remove the viewer immediately and return the remaining count.
    pub fn leave(&self, path: &str, viewer_id: &str) -> usize {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        if let Some(viewers) = state.paths.get_mut(path) {
            viewers.remove(viewer_id);
        }
        self.sweep(&mut state, path, now);
        state.count(path)
    }

    /// Active viewers on `path`.
    pub fn count(&self, path: &str) -> usize {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        self.sweep(&mut state, path, now);
        state.count(path)
    }

    /// Sweep every path now. Returns how many records were dropped.
    pub fn sweep_all(&self) -> usize {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        state.last_global_sweep = now;
        state.sweep_all(self.cutoff(now))
    }

    /// Number of paths with at least one recorded viewer.
    pub fn tracked_paths(&self) -> usize {
        self.state.lock().paths.len()
    }

    fn cutoff(&self, now: u64) -> u64 {
        now.saturating_sub(self.ttl.as_millis() as u64)
    }

    fn sweep(&self, state: &mut PresenceState, path: &str, now: u64) {
        let cutoff = self.cutoff(now);
        if now.saturating_sub(state.last_global_sweep) >= self.ttl.as_millis() as u64 {
            state.last_global_sweep = now;
            let removed = state.sweep_all(cutoff);
            if removed > 0 {
                log::debug!("Presence sweep dropped {removed} stale viewer(s)");
            }
        } else {
            state.sweep_path(path, cutoff);
        }
    }
}
