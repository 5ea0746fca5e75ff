//! Conversion of GitHub payloads onto the unified model.
//!
//! Pure functions: adapters fetch details, these map them. The payload sums
//! are closed, so every identity kind an adapter can produce has a
//! conversion here, checked exhaustively at compile time.

use chrono::{DateTime, Utc};

use super::api::{CommentDetail, EventEntry, IssueDetail, PullDetail, ReviewDetail};
use crate::activity::{
    ChangeState, Commit, Event, EventPayload, IssueState, Payload, Review,
};
use crate::router;

/// Namespace of a "owner/name" repository.
pub fn namespace(repo: &str) -> String {
    format!("github.com/{}", repo)
}

pub fn issue_state(state: &str) -> IssueState {
    if state.eq_ignore_ascii_case("open") {
        IssueState::Open
    } else {
        IssueState::Closed
    }
}

pub fn change_state(state: &str, merged: bool) -> ChangeState {
    if merged {
        ChangeState::Merged
    } else if state.eq_ignore_ascii_case("open") {
        ChangeState::Open
    } else {
        ChangeState::Abandoned
    }
}

/// Human-facing title with its module-path prefix.
pub fn prefixed_title(module: &str, title: &str) -> String {
    format!("{}: {}", module, title)
}

pub fn issue_payload(action: &str, module: &str, d: &IssueDetail) -> Payload {
    Payload::Issue {
        action: action.to_string(),
        title: prefixed_title(module, &d.title),
        body: d.body.clone(),
        url: d.html_url.clone(),
    }
}

pub fn change_payload(action: &str, module: &str, d: &PullDetail) -> Payload {
    Payload::Change {
        action: action.to_string(),
        title: prefixed_title(module, &d.title),
        body: d.body.clone(),
        url: d.html_url.clone(),
    }
}

pub fn issue_comment_payload(module: &str, issue: &IssueDetail, c: &CommentDetail) -> Payload {
    Payload::IssueComment {
        title: prefixed_title(module, &issue.title),
        issue_state: issue_state(&issue.state),
        body: c.body.clone(),
        url: c.html_url.clone(),
    }
}

pub fn change_comment_payload(module: &str, pull: &PullDetail, c: &CommentDetail) -> Payload {
    Payload::ChangeComment {
        title: prefixed_title(module, &pull.title),
        change_state: change_state(&pull.state, pull.merged),
        body: c.body.clone(),
        review: None,
        url: c.html_url.clone(),
    }
}

pub fn review_payload(module: &str, pull: &PullDetail, r: &ReviewDetail) -> Payload {
    Payload::ChangeComment {
        title: prefixed_title(module, &pull.title),
        change_state: change_state(&pull.state, pull.merged),
        body: r.body.clone(),
        review: Some(Review {
            label: r.state.to_lowercase(),
            score: super::api::review_score(&r.state),
        }),
        url: r.html_url.clone(),
    }
}

/// URL of an entry's subject, synthesized via the router when the entry
/// itself carries none.
fn entry_url(entry: &EventEntry) -> String {
    if !entry.url.is_empty() {
        return entry.url.clone();
    }
    let ns = namespace(&entry.repo);
    match entry.number {
        Some(n) if entry.is_pull => router::github_pull_url(&ns, n),
        Some(n) => router::github_issue_url(&ns, n),
        None => String::new(),
    }
}

/// Convert one public-events entry into an own-activity event.
///
/// Returns `None` for entry kinds the activity feed does not carry; those
/// are filtered data, not a contract mismatch.
pub fn event_from_entry(
    entry: &EventEntry,
    module: &str,
    merged: bool,
    commits: Vec<Commit>,
) -> Option<Event> {
    let url = entry_url(entry);
    let payload = match entry.kind.as_str() {
        "IssuesEvent" => EventPayload::Thread(Payload::Issue {
            action: entry.action.clone(),
            title: prefixed_title(module, &entry.title),
            body: entry.body.clone(),
            url: url.clone(),
        }),
        "IssueCommentEvent" => {
            if entry.is_pull {
                EventPayload::Thread(Payload::ChangeComment {
                    title: prefixed_title(module, &entry.title),
                    change_state: change_state(&entry.state, merged),
                    body: entry.body.clone(),
                    review: None,
                    url: url.clone(),
                })
            } else {
                EventPayload::Thread(Payload::IssueComment {
                    title: prefixed_title(module, &entry.title),
                    issue_state: issue_state(&entry.state),
                    body: entry.body.clone(),
                    url: url.clone(),
                })
            }
        }
        "PullRequestEvent" => {
            let action = if entry.action == "closed" && merged {
                "merged".to_string()
            } else {
                entry.action.clone()
            };
            EventPayload::Thread(Payload::Change {
                action,
                title: prefixed_title(module, &entry.title),
                body: entry.body.clone(),
                url: url.clone(),
            })
        }
        "PullRequestReviewEvent" => EventPayload::Thread(Payload::ChangeComment {
            title: prefixed_title(module, &entry.title),
            change_state: change_state(&entry.state, merged),
            body: entry.body.clone(),
            review: entry.review.clone(),
            url: url.clone(),
        }),
        "PushEvent" => EventPayload::Push { commits },
        _ => return None,
    };

    Some(Event {
        namespace: namespace(&entry.repo),
        time: entry.created_at,
        actor: entry.actor.clone(),
        payload,
    })
}

/// Time cutoff for the mail event window.
pub fn window_cutoff(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    now - chrono::Duration::days(days)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(kind: &str, action: &str) -> EventEntry {
        EventEntry {
            kind: kind.to_string(),
            repo: "a/b".to_string(),
            actor: "alice".to_string(),
            created_at: Utc.timestamp_opt(1000, 0).unwrap(),
            action: action.to_string(),
            number: Some(5),
            title: "widget rewrite".to_string(),
            body: "details".to_string(),
            state: "open".to_string(),
            url: "https://github.com/a/b/pull/5".to_string(),
            merged: None,
            review: None,
            is_pull: true,
            commits: Vec::new(),
        }
    }

    #[test]
    fn test_change_state_mapping() {
        assert_eq!(change_state("open", false), ChangeState::Open);
        assert_eq!(change_state("closed", true), ChangeState::Merged);
        assert_eq!(change_state("closed", false), ChangeState::Abandoned);
    }

    #[test]
    fn test_closed_pull_with_merge_becomes_merged_action() {
        let e = event_from_entry(&entry("PullRequestEvent", "closed"), "widget", true, vec![])
            .unwrap();
        match e.payload {
            EventPayload::Thread(Payload::Change { action, title, .. }) => {
                assert_eq!(action, "merged");
                assert_eq!(title, "widget: widget rewrite");
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_issue_comment_on_pull_is_change_comment() {
        let e = event_from_entry(&entry("IssueCommentEvent", "created"), "widget", false, vec![])
            .unwrap();
        assert!(matches!(
            e.payload,
            EventPayload::Thread(Payload::ChangeComment { review: None, .. })
        ));
    }

    #[test]
    fn test_push_event_carries_commits() {
        let commits = vec![Commit {
            sha: "abc123".to_string(),
            message: "fix the widget".to_string(),
            author: "alice".to_string(),
        }];
        let e = event_from_entry(&entry("PushEvent", ""), "widget", false, commits).unwrap();
        match e.payload {
            EventPayload::Push { commits } => assert_eq!(commits.len(), 1),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_kind_is_filtered() {
        assert!(event_from_entry(&entry("WatchEvent", "started"), "m", false, vec![]).is_none());
    }
}
