//! Mail-based Gerrit source adapter.
//!
//! Gerrit notification mail carries its event identity in the
//! `X-Gerrit-MessageType`, `X-Gerrit-Project`, and `X-Gerrit-Change-Number`
//! headers; the Message-ID (`<gerrit.{stamp}.{changekey}@host>`) supplies a
//! per-message stamp that distinguishes comments on the same change.
//! Comment mail is further classified as plain comment or review vote by
//! its body's "Patch Set N: Label+N" summary line.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::api::GerritApi;
use super::convert;
use crate::activity::service::ActivityService;
use crate::activity::{Event, EventPayload, Notification, ThreadKey, ThreadKind};
use crate::config::{DETAIL_CACHE_CAP, DETAIL_CACHE_TTL_SECS, MAIL_EVENT_WINDOW_DAYS};
use crate::error::AppError;
use crate::maillog::{walk_new, FileSeg, MailMessage, MailStore};

/// Coarse event identity parsed from a Gerrit notification mail.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GerritMailEvent {
    Opened { number: u64 },
    /// One comment (or review vote) mail, keyed by its message stamp
    Comment { number: u64, stamp: String },
    Merged { number: u64 },
    Abandoned { number: u64 },
    Restored { number: u64 },
}

impl GerritMailEvent {
    pub fn number(&self) -> u64 {
        match self {
            GerritMailEvent::Opened { number }
            | GerritMailEvent::Comment { number, .. }
            | GerritMailEvent::Merged { number }
            | GerritMailEvent::Abandoned { number }
            | GerritMailEvent::Restored { number } => *number,
        }
    }
}

/// Map the Gerrit message type and identifiers onto a coarse identity.
pub fn parse_identity(
    message_type: &str,
    change_number: u64,
    message_id: &str,
) -> Option<GerritMailEvent> {
    match message_type {
        "newchange" => Some(GerritMailEvent::Opened {
            number: change_number,
        }),
        "comment" => Some(GerritMailEvent::Comment {
            number: change_number,
            stamp: message_stamp(message_id),
        }),
        "merged" => Some(GerritMailEvent::Merged {
            number: change_number,
        }),
        "abandoned" => Some(GerritMailEvent::Abandoned {
            number: change_number,
        }),
        "restored" => Some(GerritMailEvent::Restored {
            number: change_number,
        }),
        _ => None,
    }
}

/// The stamp component of `gerrit.{stamp}.{changekey}@host`, falling back
/// to the whole Message-ID.
fn message_stamp(message_id: &str) -> String {
    message_id
        .strip_prefix("gerrit.")
        .and_then(|rest| rest.split('.').next())
        .unwrap_or(message_id)
        .to_string()
}

/// Display name of the acting user from the From header, with Gerrit's
/// "(Code Review)" suffix stripped.
pub fn from_display_name(from: &str) -> String {
    let name = match from.split_once('<') {
        Some((name, _)) => name,
        None => from,
    };
    name.trim()
        .trim_matches('"')
        .trim_end_matches("(Code Review)")
        .trim()
        .to_string()
}

#[derive(Debug, Clone)]
struct MailContext {
    sender: String,
    mentioned: bool,
    time: DateTime<Utc>,
    body: String,
}

#[derive(Debug, Clone)]
enum Resolved {
    Notification(Notification),
    OwnEvent(Event),
    Skip,
}

pub struct GerritMailAdapter {
    store: Arc<dyn MailStore>,
    api: Arc<dyn GerritApi>,
    service: ActivityService,
    host: String,
    username: String,
    wake: Arc<Notify>,
    cancel: Arc<AtomicBool>,
    watermark: Vec<FileSeg>,
    details: moka::future::Cache<GerritMailEvent, Resolved>,
}

impl GerritMailAdapter {
    pub fn new(
        store: Arc<dyn MailStore>,
        api: Arc<dyn GerritApi>,
        service: ActivityService,
        host: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            store,
            api,
            service,
            host: host.into(),
            username: username.into(),
            wake: Arc::new(Notify::new()),
            cancel: Arc::new(AtomicBool::new(false)),
            watermark: Vec::new(),
            details: moka::future::Cache::builder()
                .max_capacity(DETAIL_CACHE_CAP)
                .time_to_live(std::time::Duration::from_secs(DETAIL_CACHE_TTL_SECS))
                .build(),
        }
    }

    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub async fn run(mut self) -> Result<(), AppError> {
        loop {
            match self.poll_once().await {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "Processed Gerrit mail batch"),
                Err(e) => tracing::warn!(error = %e, "Gerrit mail poll failed, will retry"),
            }
            if self.cancel.load(Ordering::Relaxed) {
                return Ok(());
            }
            self.wake.notified().await;
        }
    }

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

        let mut notifications = Vec::new();
        let mut events = Vec::new();
        for key in &order {
            let ctx = contexts[key].clone();
            let init = resolve_identity(
                self.api.clone(),
                self.host.clone(),
                self.username.clone(),
                key.clone(),
                ctx,
            );
            match self.details.try_get_with(key.clone(), init).await {
                Ok(Resolved::Notification(n)) => notifications.push(n),
                Ok(Resolved::OwnEvent(e)) => events.push(e),
                Ok(Resolved::Skip) => {}
                Err(e) => return Err(AppError::Fetch(format!("detail lookup failed: {}", e))),
            }
        }

        let count = notifications.len() + events.len();
        self.service.merge_notifications(notifications).await;
        self.service.merge_events(events).await;
        self.watermark = new_watermark;

        if let Some(e) = walk_err {
            tracing::warn!(error = %e, "Mail walk aborted on malformed record");
        }
        Ok(count)
    }

    fn extract_identities(
        &self,
        messages: &[MailMessage],
    ) -> (Vec<GerritMailEvent>, HashMap<GerritMailEvent, MailContext>) {
        let cutoff = convert_window_cutoff();
        let mention = format!("@{}", self.username);

        let mut order = Vec::new();
        let mut contexts: HashMap<GerritMailEvent, MailContext> = HashMap::new();
        let mut duplicates = 0usize;

        for msg in messages {
            let Some(message_type) = msg.header("X-Gerrit-MessageType") else {
                continue;
            };
            let message_type = message_type.to_string();

            let Some(number) = msg
                .header("X-Gerrit-Change-Number")
                .and_then(|n| n.parse::<u64>().ok())
            else {
                tracing::debug!("Gerrit mail without change number, skipping");
                continue;
            };

            let Some(time) = msg.date() else {
                tracing::debug!("Gerrit mail without parsable Date, skipping");
                continue;
            };
            let time = time.with_timezone(&Utc);
            if time < cutoff {
                continue;
            }

            let message_id = msg.message_id().unwrap_or_default();
            let Some(key) = parse_identity(&message_type, number, message_id) else {
                tracing::debug!(%message_type, "Unrecognized Gerrit message type, skipping");
                continue;
            };

            if contexts.contains_key(&key) {
                duplicates += 1;
                continue;
            }

            let ctx = MailContext {
                sender: from_display_name(msg.header("From").unwrap_or_default()),
                mentioned: msg.body.contains(&mention),
                time,
                body: msg.body.clone(),
            };
            order.push(key.clone());
            contexts.insert(key, ctx);
        }

        if duplicates > 0 {
            tracing::debug!(duplicates, "Collapsed duplicate mail copies");
        }
        (order, contexts)
    }
}

fn convert_window_cutoff() -> DateTime<Utc> {
    Utc::now() - chrono::Duration::days(MAIL_EVENT_WINDOW_DAYS)
}

async fn resolve_identity(
    api: Arc<dyn GerritApi>,
    host: String,
    username: String,
    key: GerritMailEvent,
    ctx: MailContext,
) -> Result<Resolved, AppError> {
    let detail = match api.change(key.number()).await {
        Ok(d) => d,
        Err(e) if e.is_not_found() => {
            tracing::info!(identity = ?key, error = %e, "Unresolvable change, skipping");
            return Ok(Resolved::Skip);
        }
        Err(e) => return Err(e),
    };

    let namespace = convert::namespace(&host, &detail.project);
    let url = convert::change_url(&host, &detail);
    // No manifest service on the Gerrit side; the project path is the module
    let module = namespace.clone();

    let payload = match &key {
        GerritMailEvent::Opened { .. } => convert::change_payload("opened", &module, &detail, &url),
        GerritMailEvent::Merged { .. } => convert::change_payload("merged", &module, &detail, &url),
        GerritMailEvent::Abandoned { .. } => {
            convert::change_payload("abandoned", &module, &detail, &url)
        }
        GerritMailEvent::Restored { .. } => {
            convert::change_payload("reopened", &module, &detail, &url)
        }
        GerritMailEvent::Comment { .. } => {
            let first_line = ctx.body.lines().next().unwrap_or_default();
            let review = convert::parse_review_vote(first_line);
            let text = convert::comment_text(&ctx.body);
            convert::comment_payload(&module, &detail, &text, review, &url)
        }
    };

    let actor = if ctx.sender.is_empty() {
        detail.owner.clone()
    } else {
        ctx.sender.clone()
    };

    if actor.eq_ignore_ascii_case(&username) {
        return Ok(Resolved::OwnEvent(Event {
            namespace,
            time: ctx.time,
            actor,
            payload: EventPayload::Thread(payload),
        }));
    }

    let participating =
        detail.owner == username || detail.reviewers.iter().any(|r| *r == username);

    Ok(Resolved::Notification(Notification {
        thread: ThreadKey::new(namespace, ThreadKind::Change, detail.number),
        import_paths: vec![module],
        time: ctx.time,
        actor,
        payload,
        unread: true,
        participating,
        mentioned: ctx.mentioned,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identity_kinds() {
        assert_eq!(
            parse_identity("newchange", 42, "gerrit.1600000000.Iabc@example.org"),
            Some(GerritMailEvent::Opened { number: 42 })
        );
        assert_eq!(
            parse_identity("merged", 42, "gerrit.1600000001.Iabc@example.org"),
            Some(GerritMailEvent::Merged { number: 42 })
        );
        assert_eq!(
            parse_identity("abandoned", 42, "x"),
            Some(GerritMailEvent::Abandoned { number: 42 })
        );
        assert_eq!(
            parse_identity("restored", 42, "x"),
            Some(GerritMailEvent::Restored { number: 42 })
        );
        assert_eq!(parse_identity("newpatchset", 42, "x"), None);
    }

    #[test]
    fn test_comment_identity_keyed_by_stamp() {
        let a = parse_identity("comment", 42, "gerrit.1600000000.Iabc@example.org").unwrap();
        let b = parse_identity("comment", 42, "gerrit.1600000099.Iabc@example.org").unwrap();
        assert_ne!(a, b);
        // Copies of the same comment mail share the identity
        let c = parse_identity("comment", 42, "gerrit.1600000000.Iabc@example.org").unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn test_from_display_name() {
        assert_eq!(
            from_display_name("Alice Smith (Code Review) <noreply@example.org>"),
            "Alice Smith"
        );
        assert_eq!(
            from_display_name("\"Bob\" <gerrit@example.org>"),
            "Bob"
        );
        assert_eq!(from_display_name("gerrit@example.org"), "gerrit@example.org");
    }
}
