//! Unified activity and notification model.
//!
//! Source adapters normalize provider-specific activity into these types.
//! A [`ThreadKey`] identifies one discussion/review item; a [`Notification`]
//! is someone else's activity affecting the served user; an [`Event`] is the
//! served user's own activity. Payloads are closed sums, so converter
//! exhaustiveness is enforced at compile time.

pub mod broadcast;
pub mod cache;
pub mod readstate;
pub mod service;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cache::Recent;

/// Kind of thread a notification or event is attached to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ThreadKind {
    /// An issue-tracker item
    Issue,
    /// A code review (pull request / Gerrit change)
    Change,
}

impl fmt::Display for ThreadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadKind::Issue => write!(f, "Issue"),
            ThreadKind::Change => write!(f, "Change"),
        }
    }
}

/// Identity of a single discussion/review thread.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ThreadKey {
    /// Repository or project identifier (e.g., "github.com/owner/repo")
    pub namespace: String,
    pub kind: ThreadKind,
    pub id: u64,
}

impl ThreadKey {
    pub fn new(namespace: impl Into<String>, kind: ThreadKind, id: u64) -> Self {
        Self {
            namespace: namespace.into(),
            kind,
            id,
        }
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}-{}", self.namespace, self.kind, self.id)
    }
}

/// State of an issue thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueState {
    Open,
    Closed,
}

/// State of a change (code review) thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeState {
    Open,
    Merged,
    Abandoned,
}

/// A review verdict attached to a change comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    /// Provider label ("approved", "Code-Review", ...)
    pub label: String,
    /// Signed score where the provider has one, else 0
    pub score: i32,
}

/// Notification payload, one variant per activity shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Payload {
    Issue {
        action: String,
        title: String,
        body: String,
        url: String,
    },
    Change {
        action: String,
        title: String,
        body: String,
        url: String,
    },
    IssueComment {
        title: String,
        issue_state: IssueState,
        body: String,
        url: String,
    },
    ChangeComment {
        title: String,
        change_state: ChangeState,
        body: String,
        review: Option<Review>,
        url: String,
    },
}

impl Payload {
    /// Public HTML URL of the item this payload describes.
    pub fn url(&self) -> &str {
        match self {
            Payload::Issue { url, .. }
            | Payload::Change { url, .. }
            | Payload::IssueComment { url, .. }
            | Payload::ChangeComment { url, .. } => url,
        }
    }
}

/// Someone else's activity affecting the served user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub thread: ThreadKey,
    /// Module paths of the repository, for display grouping
    pub import_paths: Vec<String>,
    pub time: DateTime<Utc>,
    /// Login of the acting user
    pub actor: String,
    pub payload: Payload,
    pub unread: bool,
    /// The served user participates in this thread
    pub participating: bool,
    /// The served user is @-mentioned by this activity
    pub mentioned: bool,
}

/// A commit referenced by a push event, with its resolved message body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Commit {
    pub sha: String,
    pub message: String,
    pub author: String,
}

/// Payload of an own-activity event. Thread-shaped activity reuses the
/// notification payload variants; pushes carry resolved commits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EventPayload {
    Thread(Payload),
    Push { commits: Vec<Commit> },
}

/// The served user's own activity, for the activity feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub namespace: String,
    pub time: DateTime<Utc>,
    pub actor: String,
    pub payload: EventPayload,
}

impl Recent for Notification {
    type Key = (ThreadKey, DateTime<Utc>);

    fn key(&self) -> Self::Key {
        (self.thread.clone(), self.time)
    }

    fn time(&self) -> DateTime<Utc> {
        self.time
    }
}

impl Recent for Event {
    type Key = (String, DateTime<Utc>);

    fn key(&self) -> Self::Key {
        (self.namespace.clone(), self.time)
    }

    fn time(&self) -> DateTime<Utc> {
        self.time
    }
}

/// Resolve the human-facing module path of a repository from its manifest.
///
/// Reads the package name out of a Cargo.toml-style manifest when one is
/// present, else falls back to the raw repository path.
pub fn resolve_module_path(manifest: Option<&str>, namespace: &str) -> String {
    let Some(manifest) = manifest else {
        return namespace.to_string();
    };

    let mut in_package = false;
    for line in manifest.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_package = line == "[package]";
            continue;
        }
        if !in_package {
            continue;
        }
        if let Some(rest) = line.strip_prefix("name") {
            let rest = rest.trim_start();
            if let Some(value) = rest.strip_prefix('=') {
                let value = value.trim().trim_matches('"');
                if !value.is_empty() {
                    return value.to_string();
                }
            }
        }
    }

    namespace.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_key_display() {
        let t = ThreadKey::new("github.com/a/b", ThreadKind::Issue, 42);
        assert_eq!(t.to_string(), "github.com/a/b#Issue-42");
    }

    #[test]
    fn test_resolve_module_path_from_manifest() {
        let manifest = "[package]\nname = \"widget\"\nversion = \"0.3.0\"\n";
        assert_eq!(
            resolve_module_path(Some(manifest), "github.com/a/widget-rs"),
            "widget"
        );
    }

    #[test]
    fn test_resolve_module_path_ignores_other_sections() {
        let manifest = "[dependencies]\nname = \"not-a-package\"\n";
        assert_eq!(
            resolve_module_path(Some(manifest), "github.com/a/b"),
            "github.com/a/b"
        );
    }

    #[test]
    fn test_resolve_module_path_without_manifest() {
        assert_eq!(resolve_module_path(None, "github.com/a/b"), "github.com/a/b");
    }
}
