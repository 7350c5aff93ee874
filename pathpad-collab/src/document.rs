//! Document model shared by storage, access control and the wire protocol.
//!
//! A document is addressed by a slash-delimited path. Its `updated_at`
//! (seconds) is the only version marker: writes are ordered by it,
//! last-write-wins, and it strictly increases on every successful write.

use std::borrow::Cow;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::credential::Credential;

/// Maximum encoded size of a document's text (200 KiB).
pub const MAX_DOCUMENT_BYTES: usize = 200 * 1024;

/// The always write-protected landing document.
pub const HOME_PATH: &str = "home";

static MARKUP_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("markup pattern is valid"));

/// Content format of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FormatType {
    #[default]
    Text,
    Json,
    Php,
    Javascript,
    Markdown,
}

impl FormatType {
    pub const ALL: [FormatType; 5] = [
        FormatType::Text,
        FormatType::Json,
        FormatType::Php,
        FormatType::Javascript,
        FormatType::Markdown,
    ];

    /// Parse a wire name. Unknown names yield `None` so callers keep the
    /// previous format.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            "php" => Some(Self::Php),
            "javascript" => Some(Self::Javascript),
            "markdown" => Some(Self::Markdown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
            Self::Php => "php",
            Self::Javascript => "javascript",
            Self::Markdown => "markdown",
        }
    }
}

impl fmt::Display for FormatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted document record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub path: String,
    pub text: String,
    pub format_type: FormatType,
    /// Version marker, seconds since epoch
    pub updated_at: u64,
    pub created_at: u64,
    pub password_hash: Option<Credential>,
    pub requires_write_password: bool,
    pub requires_read_password: bool,
    pub blocked: bool,
    pub blocked_reason: Option<String>,
    pub blocked_at: Option<u64>,
    pub unique_pageviews: u64,
    pub total_pageviews: u64,
}

impl Document {
    /// A fresh, empty, unprotected document. `home` starts write-protected.
    pub fn new(path: impl Into<String>, now_secs: u64) -> Self {
        let path = path.into();
        let requires_write_password = path == HOME_PATH;
        Self {
            path,
            text: String::new(),
            format_type: FormatType::Text,
            updated_at: now_secs,
            created_at: now_secs,
            password_hash: None,
            requires_write_password,
            requires_read_password: false,
            blocked: false,
            blocked_reason: None,
            blocked_at: None,
            unique_pageviews: 0,
            total_pageviews: 0,
        }
    }

    pub fn is_home(&self) -> bool {
        self.path == HOME_PATH
    }

    pub fn has_password(&self) -> bool {
        self.password_hash.is_some()
    }

    /// Write axis is PROTECTED. `home` always is, even before its
    /// password exists.
    pub fn write_protected(&self) -> bool {
        self.is_home() || (self.requires_write_password && self.has_password())
    }

    /// Read axis is LOCKED.
    pub fn read_locked(&self) -> bool {
        self.requires_read_password && self.has_password()
    }

    /// Replace text and bump the version. Size must already be checked.
    pub(crate) fn apply_text(&mut self, text: String, format: Option<FormatType>, now_secs: u64) {
        self.text = text;
        if let Some(format) = format {
            self.format_type = format;
        }
        self.touch(now_secs);
    }

    /// Advance `updated_at` so that it is strictly greater than before.
    pub(crate) fn touch(&mut self, now_secs: u64) {
        self.updated_at = next_version(self.updated_at, now_secs);
    }

    pub(crate) fn set_flags(&mut self, requires_write: bool, requires_read: bool) {
        self.requires_write_password = requires_write || self.is_home();
        self.requires_read_password = requires_read;
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            path: self.path.clone(),
            text: self.text.clone(),
            updated_at: self.updated_at,
            format_type: self.format_type,
        }
    }

    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            path: self.path.clone(),
            updated_at: self.updated_at,
            format_type: self.format_type,
            size_bytes: self.text.len(),
            requires_write_password: self.requires_write_password || self.is_home(),
            requires_read_password: self.requires_read_password,
            has_password: self.has_password(),
            blocked: self.blocked,
            blocked_reason: self.blocked_reason.clone(),
            blocked_at: self.blocked_at,
            unique_pageviews: self.unique_pageviews,
            total_pageviews: self.total_pageviews,
        }
    }
}

/// Next `updated_at` after `previous` given the current time.
pub fn next_version(previous: u64, now_secs: u64) -> u64 {
    now_secs.max(previous.saturating_add(1))
}

/// Change event payload: what every viewer needs to converge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub path: String,
    pub text: String,
    pub updated_at: u64,
    pub format_type: FormatType,
}

impl DocumentSnapshot {
    /// Same version marker with the text withheld.
    pub fn redacted(&self) -> Self {
        Self {
            path: self.path.clone(),
            text: String::new(),
            updated_at: self.updated_at,
            format_type: self.format_type,
        }
    }
}

/// Read response for a single viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentView {
    pub path: String,
    /// Empty whenever `locked` is set
    pub text: String,
    pub updated_at: u64,
    pub format_type: FormatType,
    pub requires_write_password: bool,
    pub requires_read_password: bool,
    pub has_password: bool,
    pub is_home: bool,
    pub locked: bool,
    pub unique_pageviews: u64,
    pub total_pageviews: u64,
}

impl DocumentView {
    /// Build the view; text is withheld when `locked`.
    pub fn of(doc: &Document, locked: bool) -> Self {
        Self {
            path: doc.path.clone(),
            text: if locked { String::new() } else { doc.text.clone() },
            updated_at: doc.updated_at,
            format_type: doc.format_type,
            requires_write_password: doc.write_protected(),
            requires_read_password: doc.requires_read_password,
            has_password: doc.has_password(),
            is_home: doc.is_home(),
            locked,
            unique_pageviews: doc.unique_pageviews,
            total_pageviews: doc.total_pageviews,
        }
    }
}

/// Metadata listing entry (related links, admin dashboard). Never carries text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub path: String,
    pub updated_at: u64,
    pub format_type: FormatType,
    pub size_bytes: usize,
    pub requires_write_password: bool,
    pub requires_read_password: bool,
    pub has_password: bool,
    pub blocked: bool,
    pub blocked_reason: Option<String>,
    pub blocked_at: Option<u64>,
    pub unique_pageviews: u64,
    pub total_pageviews: u64,
}

// ─── Paths ────────────────────────────────────────────────────────────

/// Canonical form of a path: no surrounding slashes or whitespace, no
/// empty segments. The root maps to `home`.
pub fn normalize_path(raw: &str) -> String {
    let joined = raw
        .split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    if joined.is_empty() {
        HOME_PATH.to_string()
    } else {
        joined
    }
}

/// True when `path` is exactly one segment below `prefix`. An empty
/// prefix selects top-level paths.
pub fn is_immediate_child(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() {
        return !path.is_empty() && !path.contains('/');
    }
    match path.strip_prefix(prefix).and_then(|rest| rest.strip_prefix('/')) {
        Some(rest) => !rest.is_empty() && !rest.contains('/'),
        None => false,
    }
}

// ─── Content ──────────────────────────────────────────────────────────

/// Whether `text` is over the size limit, returning its encoded size if so.
pub fn oversized(text: &str) -> Option<usize> {
    let size = text.len();
    (size > MAX_DOCUMENT_BYTES).then_some(size)
}

/// Remove `<...>` tags from submitted text.
pub fn strip_markup(text: &str) -> Cow<'_, str> {
    MARKUP_TAG.replace_all(text, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parse() {
        assert_eq!(FormatType::parse("json"), Some(FormatType::Json));
        assert_eq!(FormatType::parse(" Markdown "), Some(FormatType::Markdown));
        assert_eq!(FormatType::parse("cobol"), None);
        for format in FormatType::ALL {
            assert_eq!(FormatType::parse(format.as_str()), Some(format));
        }
    }

    #[test]
    fn test_new_home_is_write_protected() {
        let home = Document::new(HOME_PATH, 10);
        assert!(home.requires_write_password);
        assert!(home.write_protected());
        assert!(!home.read_locked());

        let other = Document::new("notes", 10);
        assert!(!other.write_protected());
    }

    #[test]
    fn test_flags_need_password() {
        let mut doc = Document::new("docs/readme", 10);
        doc.set_flags(true, true);
        assert!(!doc.write_protected());
        assert!(!doc.read_locked());
    }

    #[test]
    fn test_home_flag_cannot_be_cleared() {
        let mut home = Document::new(HOME_PATH, 10);
        home.set_flags(false, false);
        assert!(home.requires_write_password);
    }

    #[test]
    fn test_next_version_strictly_increases() {
        assert_eq!(next_version(100, 150), 150);
        assert_eq!(next_version(100, 100), 101);
        assert_eq!(next_version(100, 50), 101);
    }

    #[test]
    fn test_apply_text_keeps_format_when_unknown() {
        let mut doc = Document::new("a", 10);
        doc.apply_text("{}".into(), Some(FormatType::Json), 10);
        assert_eq!(doc.format_type, FormatType::Json);
        assert_eq!(doc.updated_at, 11);
        doc.apply_text("x".into(), FormatType::parse("bogus"), 11);
        assert_eq!(doc.format_type, FormatType::Json);
        assert_eq!(doc.updated_at, 12);
    }

    #[test]
    fn test_view_withholds_text_when_locked() {
        let mut doc = Document::new("secret", 10);
        doc.text = "classified".into();
        let view = DocumentView::of(&doc, true);
        assert!(view.locked);
        assert!(view.text.is_empty());
        assert_eq!(DocumentView::of(&doc, false).text, "classified");
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/docs//readme/"), "docs/readme");
        assert_eq!(normalize_path(""), HOME_PATH);
        assert_eq!(normalize_path("/"), HOME_PATH);
        assert_eq!(normalize_path(" a / b "), "a/b");
    }

    #[test]
    fn test_immediate_child() {
        assert!(is_immediate_child("docs", "docs/readme"));
        assert!(!is_immediate_child("docs", "docs/readme/deep"));
        assert!(!is_immediate_child("docs", "docs"));
        assert!(!is_immediate_child("docs", "docsx/readme"));
        assert!(is_immediate_child("", "docs"));
        assert!(!is_immediate_child("", "docs/readme"));
    }

    #[test]
    fn test_size_limit_is_bytes() {
        assert!(oversized(&"a".repeat(MAX_DOCUMENT_BYTES)).is_none());
        assert_eq!(
            oversized(&"a".repeat(MAX_DOCUMENT_BYTES + 1)),
            Some(MAX_DOCUMENT_BYTES + 1)
        );
        // 'é' is two bytes in UTF-8
        let accented = "é".repeat(MAX_DOCUMENT_BYTES / 2 + 1);
        assert!(oversized(&accented).is_some());
    }

    #[test]
    fn test_strip_markup() {
        assert_eq!(strip_markup("a <b>bold</b> c"), "a bold c");
        assert_eq!(strip_markup("1 < 2"), "1 < 2");
        assert_eq!(strip_markup("plain"), "plain");
    }
}
