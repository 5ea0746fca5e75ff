//! Mail-based GitHub source adapter.
//!
//! Walks the mail archive for GitHub notification mail, extracts coarse
//! event identities from Message-ID structure (with a body-prefix match for
//! ambiguous event mail), deduplicates identities within the batch, fetches
//! full detail per distinct identity, and classifies each as the served
//! user's own activity (events feed) or a notification.
//!
//! Detail resolutions are memoized across batches, so re-delivered mail
//! after a watermark reset costs no extra API calls.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::api::GithubApi;
use super::convert;
use crate::activity::service::ActivityService;
use crate::activity::{resolve_module_path, Event, EventPayload, Notification, ThreadKey, ThreadKind};
use crate::config::{DETAIL_CACHE_CAP, DETAIL_CACHE_TTL_SECS, MAIL_EVENT_WINDOW_DAYS};
use crate::error::AppError;
use crate::maillog::{walk_new, FileSeg, MailMessage, MailStore};

/// Disambiguated action of an issue-event mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToggleAction {
    Closed,
    Merged,
    Reopened,
}

impl ToggleAction {
    fn as_str(self) -> &'static str {
        match self {
            ToggleAction::Closed => "closed",
            ToggleAction::Merged => "merged",
            ToggleAction::Reopened => "reopened",
        }
    }
}

/// Coarse event identity parsed from a GitHub notification mail.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GithubMailEvent {
    /// `owner/repo/issues/N` or `owner/repo/pull/N`
    Opened { repo: String, number: u64, pull: bool },
    /// `owner/repo/issues/N/C` (also used for comments on pull requests)
    Comment {
        repo: String,
        number: u64,
        comment_id: u64,
    },
    /// `owner/repo/pull/N/review/R`
    Review {
        repo: String,
        number: u64,
        review_id: u64,
    },
    /// `owner/repo/{issues,pull}/N/issue_event/E`, action from body prefix
    Toggled {
        repo: String,
        number: u64,
        event_id: u64,
        action: ToggleAction,
    },
}

impl GithubMailEvent {
    pub fn repo(&self) -> &str {
        match self {
            GithubMailEvent::Opened { repo, .. }
            | GithubMailEvent::Comment { repo, .. }
            | GithubMailEvent::Review { repo, .. }
            | GithubMailEvent::Toggled { repo, .. } => repo,
        }
    }
}

/// Reasons that mean the served user participates in the thread.
const PARTICIPATING_REASONS: &[&str] = &[
    "author",
    "comment",
    "mention",
    "assign",
    "review_requested",
    "state_change",
];

/// Parse a coarse event identity out of a Message-ID. Event mail
/// (`issue_event`) is ambiguous between closed/merged/reopened and is
/// disambiguated by the first body line.
pub fn parse_message_id(id: &str, body_first_line: &str) -> Option<GithubMailEvent> {
    let path = id.strip_suffix("@github.com")?;
    let segments: Vec<&str> = path.split('/').collect();

    let repo = |s: &[&str]| format!("{}/{}", s[0], s[1]);
    match segments.as_slice() {
        [_, _, kind @ ("issues" | "pull"), n] => Some(GithubMailEvent::Opened {
            repo: repo(&segments),
            number: n.parse().ok()?,
            pull: *kind == "pull",
        }),
        [_, _, "issues" | "pull", n, c] => Some(GithubMailEvent::Comment {
            repo: repo(&segments),
            number: n.parse().ok()?,
            comment_id: c.parse().ok()?,
        }),
        [_, _, "pull", n, "review", r] => Some(GithubMailEvent::Review {
            repo: repo(&segments),
            number: n.parse().ok()?,
            review_id: r.parse().ok()?,
        }),
        [_, _, "issues" | "pull", n, "issue_event", e] => {
            let action = if body_first_line.starts_with("Closed") {
                ToggleAction::Closed
            } else if body_first_line.starts_with("Merged") {
                ToggleAction::Merged
            } else if body_first_line.starts_with("Reopened") {
                ToggleAction::Reopened
            } else {
                return None;
            };
            Some(GithubMailEvent::Toggled {
                repo: repo(&segments),
                number: n.parse().ok()?,
                event_id: e.parse().ok()?,
                action,
            })
        }
        _ => None,
    }
}

/// Per-mail context captured from the representative copy of an identity.
#[derive(Debug, Clone)]
struct MailContext {
    sender: String,
    participating: bool,
    mentioned: bool,
    time: DateTime<Utc>,
}

/// Outcome of resolving one identity, memoized across batches.
#[derive(Debug, Clone)]
enum Resolved {
    Notification(Notification),
    OwnEvent(Event),
    /// Unresolvable reference (deleted repo/issue/comment), skipped
    Skip,
}

pub struct GithubMailAdapter {
    store: Arc<dyn MailStore>,
    api: Arc<dyn GithubApi>,
    service: ActivityService,
    login: String,
    wake: Arc<Notify>,
    cancel: Arc<AtomicBool>,
    watermark: Vec<FileSeg>,
    details: moka::future::Cache<GithubMailEvent, Resolved>,
    modules: HashMap<String, String>,
}

impl GithubMailAdapter {
    pub fn new(
        store: Arc<dyn MailStore>,
        api: Arc<dyn GithubApi>,
        service: ActivityService,
        login: impl Into<String>,
    ) -> Self {
        Self {
            store,
            api,
            service,
            login: login.into(),
            wake: Arc::new(Notify::new()),
            cancel: Arc::new(AtomicBool::new(false)),
            watermark: Vec::new(),
            details: moka::future::Cache::builder()
                .max_capacity(DETAIL_CACHE_CAP)
                .time_to_live(std::time::Duration::from_secs(DETAIL_CACHE_TTL_SECS))
                .build(),
            modules: HashMap::new(),
        }
    }

    /// Handle used to signal "new mail available".
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Poll loop: process a batch, then block on the wake-up signal.
    pub async fn run(mut self) -> Result<(), AppError> {
        loop {
            match self.poll_once().await {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "Processed GitHub mail batch"),
                Err(e) => tracing::warn!(error = %e, "GitHub mail poll failed, will retry"),
            }
            if self.cancel.load(Ordering::Relaxed) {
                return Ok(());
            }
            self.wake.notified().await;
        }
    }

    /// Walk unhandled mail and process one batch. The watermark advances
    /// only when every detail lookup of the batch succeeded.
    pub async fn poll_once(&mut self) -> Result<usize, AppError> {
        let mut messages: Vec<MailMessage> = Vec::new();
        let (new_watermark, walk_err) =
            match walk_new(self.store.as_ref(), &self.watermark, &self.cancel, |m| {
                messages.push(m)
            }) {
                Ok(w) => (w, None),
                Err(e) => {
                    let safe = e.handled.clone();
                    (safe, Some(e))
                }
            };

        let (order, contexts) = self.extract_identities(&messages);

        // Resolve module paths per repo before the identity loop
        let repos: HashSet<String> = order.iter().map(|k| k.repo().to_string()).collect();
        for repo in repos {
            self.ensure_module(&repo).await;
        }

        let mut notifications = Vec::new();
        let mut events = Vec::new();
        for key in &order {
            let ctx = contexts[key].clone();
            let module = self.modules[key.repo()].clone();
            let init = resolve_identity(
                self.api.clone(),
                module,
                self.login.clone(),
                key.clone(),
                ctx,
            );
            match self.details.try_get_with(key.clone(), init).await {
                Ok(Resolved::Notification(n)) => notifications.push(n),
                Ok(Resolved::OwnEvent(e)) => events.push(e),
                Ok(Resolved::Skip) => {}
                // Transient failure: abort the batch without advancing the
                // watermark; the next wake-up retries it.
                Err(e) => return Err(AppError::Fetch(format!("detail lookup failed: {}", e))),
            }
        }

        let count = notifications.len() + events.len();
        self.service.merge_notifications(notifications).await;
        self.service.merge_events(events).await;
        self.watermark = new_watermark;

        if let Some(e) = walk_err {
            // Data error: the failing segment stays behind the watermark and
            // is retried; everything before it was processed normally.
            tracing::warn!(error = %e, "Mail walk aborted on malformed record");
        }
        Ok(count)
    }

    /// Filter relevant notification mail, apply the event window, and
    /// deduplicate coarse identities. One logical event often produces
    /// multiple mail copies; the first copy wins.
    fn extract_identities(
        &self,
        messages: &[MailMessage],
    ) -> (Vec<GithubMailEvent>, HashMap<GithubMailEvent, MailContext>) {
        let cutoff = convert::window_cutoff(Utc::now(), MAIL_EVENT_WINDOW_DAYS);
        let mention = format!("@{}", self.login);

        let mut order = Vec::new();
        let mut contexts: HashMap<GithubMailEvent, MailContext> = HashMap::new();
        let mut duplicates = 0usize;

        for msg in messages {
            let Some(reason) = msg.header("X-GitHub-Reason") else {
                continue;
            };
            let reason = reason.to_string();

            let Some(time) = msg.date() else {
                tracing::debug!("GitHub mail without parsable Date, skipping");
                continue;
            };
            let time = time.with_timezone(&Utc);
            if time < cutoff {
                continue;
            }

            let Some(id) = msg.message_id() else {
                tracing::debug!("GitHub mail without Message-ID, skipping");
                continue;
            };
            let Some(key) = parse_message_id(id, msg.body_first_line()) else {
                tracing::debug!(message_id = %id, "Unrecognized GitHub message id, skipping");
                continue;
            };

            if contexts.contains_key(&key) {
                duplicates += 1;
                continue;
            }

            let sender = msg.header("X-GitHub-Sender").unwrap_or_default().to_string();
            let ctx = MailContext {
                mentioned: reason == "mention" || msg.body.contains(&mention),
                participating: PARTICIPATING_REASONS.contains(&reason.as_str()),
                sender,
                time,
            };
            order.push(key.clone());
            contexts.insert(key, ctx);
        }

        if duplicates > 0 {
            tracing::debug!(duplicates, "Collapsed duplicate mail copies");
        }
        (order, contexts)
    }

    async fn ensure_module(&mut self, repo: &str) {
        if self.modules.contains_key(repo) {
            return;
        }
        let manifest = match self.api.manifest(repo).await {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(repo, error = %e, "Manifest lookup failed, using repo path");
                None
            }
        };
        let module = resolve_module_path(manifest.as_deref(), &convert::namespace(repo));
        self.modules.insert(repo.to_string(), module);
    }
}

/// Fetch detail for one identity and build the resolved item.
async fn resolve_identity(
    api: Arc<dyn GithubApi>,
    module: String,
    login: String,
    key: GithubMailEvent,
    ctx: MailContext,
) -> Result<Resolved, AppError> {
    let built = build_item(api.as_ref(), &module, &key).await;
    let (kind, number, payload, detail_actor) = match built {
        Ok(item) => item,
        Err(e) if e.is_not_found() => {
            tracing::info!(identity = ?key, error = %e, "Unresolvable reference, skipping");
            return Ok(Resolved::Skip);
        }
        Err(e) => return Err(e),
    };

    let actor = if ctx.sender.is_empty() {
        detail_actor
    } else {
        ctx.sender.clone()
    };
    let namespace = convert::namespace(key.repo());

    if actor == login {
        return Ok(Resolved::OwnEvent(Event {
            namespace,
            time: ctx.time,
            actor,
            payload: EventPayload::Thread(payload),
        }));
    }

    Ok(Resolved::Notification(Notification {
        thread: ThreadKey::new(namespace.clone(), kind, number),
        import_paths: vec![module],
        time: ctx.time,
        actor,
        payload,
        unread: true,
        participating: ctx.participating,
        mentioned: ctx.mentioned,
    }))
}

/// Fetch and convert one identity. Returns thread kind, thread id, payload,
/// and the acting user according to the detail service.
async fn build_item(
    api: &dyn GithubApi,
    module: &str,
    key: &GithubMailEvent,
) -> Result<(ThreadKind, u64, crate::activity::Payload, String), AppError> {
    match key {
        GithubMailEvent::Opened {
            repo,
            number,
            pull: false,
        } => {
            let issue = api.issue(repo, *number).await?;
            let actor = issue.author.clone();
            Ok((
                ThreadKind::Issue,
                *number,
                convert::issue_payload("opened", module, &issue),
                actor,
            ))
        }
        GithubMailEvent::Opened {
            repo,
            number,
            pull: true,
        } => {
            let pull = api.pull(repo, *number).await?;
            let actor = pull.author.clone();
            Ok((
                ThreadKind::Change,
                *number,
                convert::change_payload("opened", module, &pull),
                actor,
            ))
        }
        GithubMailEvent::Toggled {
            repo,
            number,
            action,
            ..
        } => {
            let issue = api.issue(repo, *number).await?;
            if issue.is_pull {
                let pull = api.pull(repo, *number).await?;
                let actor = pull.author.clone();
                Ok((
                    ThreadKind::Change,
                    *number,
                    convert::change_payload(action.as_str(), module, &pull),
                    actor,
                ))
            } else {
                let actor = issue.author.clone();
                Ok((
                    ThreadKind::Issue,
                    *number,
                    convert::issue_payload(action.as_str(), module, &issue),
                    actor,
                ))
            }
        }
        GithubMailEvent::Comment {
            repo,
            number,
            comment_id,
        } => {
            let issue = api.issue(repo, *number).await?;
            let comment = api.issue_comment(repo, *comment_id).await?;
            let actor = comment.author.clone();
            if issue.is_pull {
                let pull = api.pull(repo, *number).await?;
                Ok((
                    ThreadKind::Change,
                    *number,
                    convert::change_comment_payload(module, &pull, &comment),
                    actor,
                ))
            } else {
                Ok((
                    ThreadKind::Issue,
                    *number,
                    convert::issue_comment_payload(module, &issue, &comment),
                    actor,
                ))
            }
        }
        GithubMailEvent::Review {
            repo,
            number,
            review_id,
        } => {
            let pull = api.pull(repo, *number).await?;
            let review = api.review(repo, *number, *review_id).await?;
            let actor = review.author.clone();
            Ok((
                ThreadKind::Change,
                *number,
                convert::review_payload(module, &pull, &review),
                actor,
            ))
        }
    }
}
