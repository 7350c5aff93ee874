//! Client-side save reconciliation.
//!
//! Merges three uncoordinated streams into one view of a document: local
//! keystrokes (debounced), confirmations of our own saves, and remote
//! snapshots pushed or polled from the server.
//!
//! ```text
//!            edit                    fire (debounce / blur)
//!   Idle ───────────► PendingSave ─────────────────────────► Saving
//!    ▲                    │  ▲                                 │  │
//!    │                    │  └──── confirmed / newer remote ───┘  │
//!    │   needs password   ▼       (queued edit resumes)           │ password
//!    │          AwaitingPasswordThenSave ◄────────────────────────┘ failure
//!    └──── confirmed / newer remote / fallback (nothing queued)
//! ```
//!
//! Ordering is by `updated_at` only. While a save is in flight the version
//! we last knew to be saved is remembered; any snapshot at or below it
//! predates our save and is dropped. The first snapshot above it ends the
//! flight and is trusted. If neither arrives, a fallback timer ends the
//! flight and the optimistic local text stands.
//!
//! The reconciler never sleeps: callers pass `now` in and ask for
//! [`SaveReconciler::next_deadline`] to schedule the next [`SaveReconciler::tick`].

use std::time::{Duration, Instant};

use crate::document::{DocumentSnapshot, DocumentView, FormatType};
use crate::protocol::ErrorKind;

/// Debounce after the last keystroke.
pub const DEBOUNCE: Duration = Duration::from_millis(1200);

/// Longest wait for a confirming snapshot.
pub const CONFIRM_FALLBACK: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub debounce: Duration,
    pub confirm_fallback: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            debounce: DEBOUNCE,
            confirm_fallback: CONFIRM_FALLBACK,
        }
    }
}

/// An edit waiting for its debounce to fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEdit {
    pub text: String,
    pub fire_at: Instant,
}

/// A save the server has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub submitted: String,
    /// Last saved `updated_at` known when the save was sent
    pub remembered: u64,
    pub fallback_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveState {
    Idle,
    PendingSave(PendingEdit),
    /// `queued` holds edits typed after the save went out
    Saving {
        flight: InFlight,
        queued: Option<PendingEdit>,
    },
    AwaitingPasswordThenSave {
        parked: String,
    },
}

/// User-facing save indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStatus {
    Idle,
    Saving,
    Saved,
    WaitingPassword,
    NotSaved,
}

/// What the save prompt should ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordPrompt {
    /// Document is protected but has no password yet (first write to home)
    SetPassword,
    EnterPassword,
}

/// A save the caller must send to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveRequest {
    pub path: String,
    pub text: String,
    pub password: Option<String>,
    pub format: Option<FormatType>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcilerAction {
    Submit(SaveRequest),
    PromptPassword(PasswordPrompt),
}

pub struct SaveReconciler {
    config: ReconcilerConfig,
    path: String,
    state: SaveState,
    status: SaveStatus,
    /// What the editor shows
    view: String,
    last_saved: u64,
    format: FormatType,
    pending_format: Option<FormatType>,
    needs_write_password: bool,
    has_password: bool,
    /// Remembered write password
    credential: Option<String>,
}

impl SaveReconciler {
    pub fn new(path: impl Into<String>) -> Self {
        Self::with_config(path, ReconcilerConfig::default())
    }

    pub fn with_config(path: impl Into<String>, config: ReconcilerConfig) -> Self {
        Self {
            config,
            path: path.into(),
            state: SaveState::Idle,
            status: SaveStatus::Idle,
            view: String::new(),
            last_saved: 0,
            format: FormatType::Text,
            pending_format: None,
            needs_write_password: false,
            has_password: false,
            credential: None,
        }
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn view(&self) -> &str {
        &self.view
    }

    pub fn state(&self) -> &SaveState {
        &self.state
    }

    pub fn status(&self) -> SaveStatus {
        self.status
    }

    pub fn last_saved(&self) -> u64 {
        self.last_saved
    }

    pub fn format(&self) -> FormatType {
        self.format
    }

    pub fn is_saving(&self) -> bool {
        matches!(self.state, SaveState::Saving { .. })
    }

    /// When [`tick`](Self::tick) next has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match &self.state {
            SaveState::PendingSave(pending) => Some(pending.fire_at),
            SaveState::Saving { flight, queued } => Some(match queued {
                Some(q) => q.fire_at.min(flight.fallback_at),
                None => flight.fallback_at,
            }),
            SaveState::Idle | SaveState::AwaitingPasswordThenSave { .. } => None,
        }
    }

    // ─── Inputs ───────────────────────────────────────────────────────

    /// Initial (or reloaded) document state. Drops any local state.
    pub fn load(&mut self, view: &DocumentView) {
        self.view = view.text.clone();
        self.last_saved = view.updated_at;
        self.format = view.format_type;
        self.pending_format = None;
        self.state = SaveState::Idle;
        self.status = SaveStatus::Idle;
        self.update_access(view);
    }

    /// Refresh the write policy after an access change.
    pub fn update_access(&mut self, view: &DocumentView) {
        self.needs_write_password = view.requires_write_password;
        self.has_password = view.has_password;
    }

    /// Remember a password to send with saves.
    pub fn set_credential(&mut self, password: Option<String>) {
        self.credential = password.filter(|p| !p.trim().is_empty());
    }

    /// A keystroke. Restarts the debounce; earlier timers never fire.
    pub fn edit(&mut self, text: impl Into<String>, now: Instant) {
        let text = text.into();
        self.view = text.clone();
        let pending = PendingEdit {
            text,
            fire_at: now + self.config.debounce,
        };
        self.state = match std::mem::replace(&mut self.state, SaveState::Idle) {
            SaveState::Idle | SaveState::PendingSave(_) => SaveState::PendingSave(pending),
            SaveState::Saving { flight, .. } => SaveState::Saving {
                flight,
                queued: Some(pending),
            },
            SaveState::AwaitingPasswordThenSave { .. } => {
                SaveState::AwaitingPasswordThenSave { parked: pending.text }
            }
        };
    }

    /// Change the document format; saved with the next submit.
    pub fn set_format(&mut self, format: FormatType, now: Instant) {
        self.format = format;
        self.pending_format = Some(format);
        let text = self.view.clone();
        self.edit(text, now);
    }

    /// Editor lost focus: fire any pending edit now.
    pub fn blur(&mut self, now: Instant) -> Option<ReconcilerAction> {
        match std::mem::replace(&mut self.state, SaveState::Idle) {
            SaveState::PendingSave(pending) => Some(self.fire(pending.text, now)),
            SaveState::Saving {
                queued: Some(queued),
                ..
            } => Some(self.fire(queued.text, now)),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Advance timers.
    pub fn tick(&mut self, now: Instant) -> Option<ReconcilerAction> {
        match std::mem::replace(&mut self.state, SaveState::Idle) {
            SaveState::PendingSave(pending) if pending.fire_at <= now => {
                Some(self.fire(pending.text, now))
            }
            SaveState::Saving {
                queued: Some(queued),
                ..
            } if queued.fire_at <= now => Some(self.fire(queued.text, now)),
            SaveState::Saving { flight, queued } if flight.fallback_at <= now => {
                log::debug!("No confirmation for {} within fallback, keeping local text", self.path);
                self.finish_flight(queued);
                None
            }
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Our own save was acknowledged.
    pub fn confirm(&mut self, saved: &DocumentSnapshot) {
        if saved.updated_at > self.last_saved {
            self.last_saved = saved.updated_at;
        }
        if self.needs_write_password && !self.has_password {
            // First write installed the password
            self.has_password = true;
        }
        match std::mem::replace(&mut self.state, SaveState::Idle) {
            SaveState::Saving { queued, .. } => self.finish_flight(queued),
            // Late ack after the fallback already ended the flight
            other => self.state = other,
        }
        if self.state == SaveState::Idle {
            self.status = SaveStatus::Saved;
        }
    }

    /// A snapshot from the broadcast or a poll. Returns true when the
    /// visible text changed.
    pub fn remote(&mut self, snapshot: &DocumentSnapshot) -> bool {
        if snapshot.updated_at <= self.last_saved {
            return false;
        }
        match std::mem::replace(&mut self.state, SaveState::Idle) {
            SaveState::Saving { flight, queued } => {
                if snapshot.updated_at <= flight.remembered {
                    self.state = SaveState::Saving { flight, queued };
                    return false;
                }
                self.last_saved = snapshot.updated_at;
                match queued {
                    // Unsent typing stays on screen and will win by version
                    Some(queued) => {
                        self.state = SaveState::PendingSave(queued);
                        false
                    }
                    None => {
                        self.status = SaveStatus::Saved;
                        self.accept(snapshot)
                    }
                }
            }
            pending @ (SaveState::PendingSave(_) | SaveState::AwaitingPasswordThenSave { .. }) => {
                self.last_saved = snapshot.updated_at;
                self.state = pending;
                false
            }
            SaveState::Idle => {
                self.last_saved = snapshot.updated_at;
                self.accept(snapshot)
            }
        }
    }

    /// The server rejected our save.
    pub fn save_failed(&mut self, kind: ErrorKind) -> Option<ReconcilerAction> {
        let state = std::mem::replace(&mut self.state, SaveState::Idle);
        match kind {
            ErrorKind::PasswordRequired | ErrorKind::IncorrectPassword => {
                self.credential = None;
                self.needs_write_password = true;
                let parked = match state {
                    SaveState::Saving { queued: Some(q), .. } => q.text,
                    SaveState::Saving { flight, .. } => flight.submitted,
                    SaveState::PendingSave(p) => p.text,
                    SaveState::AwaitingPasswordThenSave { parked } => parked,
                    SaveState::Idle => self.view.clone(),
                };
                self.state = SaveState::AwaitingPasswordThenSave { parked };
                self.status = SaveStatus::WaitingPassword;
                Some(ReconcilerAction::PromptPassword(self.prompt()))
            }
            _ => {
                match state {
                    SaveState::Saving { queued, .. } => self.finish_flight(queued),
                    other => self.state = other,
                }
                self.status = SaveStatus::NotSaved;
                None
            }
        }
    }

    /// Password entered at the prompt. Sends the parked save, if any.
    pub fn provide_password(&mut self, password: impl Into<String>, now: Instant) -> Option<ReconcilerAction> {
        self.set_credential(Some(password.into()));
        match std::mem::replace(&mut self.state, SaveState::Idle) {
            SaveState::AwaitingPasswordThenSave { parked } => Some(self.fire(parked, now)),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Prompt dismissed. The parked text stays on screen, unsaved.
    pub fn cancel_password(&mut self) {
        if matches!(self.state, SaveState::AwaitingPasswordThenSave { .. }) {
            self.state = SaveState::Idle;
            self.status = SaveStatus::NotSaved;
        }
    }

    // ─── Transitions ──────────────────────────────────────────────────

    fn fire(&mut self, text: String, now: Instant) -> ReconcilerAction {
        if self.needs_write_password && self.credential.is_none() {
            self.state = SaveState::AwaitingPasswordThenSave { parked: text };
            self.status = SaveStatus::WaitingPassword;
            return ReconcilerAction::PromptPassword(self.prompt());
        }

        self.view = text.clone();
        self.state = SaveState::Saving {
            flight: InFlight {
                submitted: text.clone(),
                remembered: self.last_saved,
                fallback_at: now + self.config.confirm_fallback,
            },
            queued: None,
        };
        self.status = SaveStatus::Saving;
        ReconcilerAction::Submit(SaveRequest {
            path: self.path.clone(),
            text,
            password: self.credential.clone(),
            format: self.pending_format.take(),
        })
    }

    fn finish_flight(&mut self, queued: Option<PendingEdit>) {
        match queued {
            Some(queued) => self.state = SaveState::PendingSave(queued),
            None => {
                self.state = SaveState::Idle;
                self.status = SaveStatus::Saved;
            }
        }
    }

    fn accept(&mut self, snapshot: &DocumentSnapshot) -> bool {
        self.format = snapshot.format_type;
        if self.view == snapshot.text {
            return false;
        }
        self.view = snapshot.text.clone();
        true
    }

    fn prompt(&self) -> PasswordPrompt {
        if self.has_password {
            PasswordPrompt::EnterPassword
        } else {
            PasswordPrompt::SetPassword
        }
    }
}
