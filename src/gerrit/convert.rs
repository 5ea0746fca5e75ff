//! Conversion of Gerrit payloads onto the unified model.

use super::api::ChangeDetail;
use crate::activity::{ChangeState, Payload, Review};
use crate::router;

/// Namespace of a Gerrit project on a host.
pub fn namespace(host: &str, project: &str) -> String {
    format!("{}/{}", host, project)
}

pub fn change_state(status: &str) -> ChangeState {
    match status {
        "MERGED" => ChangeState::Merged,
        "ABANDONED" => ChangeState::Abandoned,
        _ => ChangeState::Open,
    }
}

pub fn change_payload(action: &str, module: &str, detail: &ChangeDetail, url: &str) -> Payload {
    Payload::Change {
        action: action.to_string(),
        title: format!("{}: {}", module, detail.subject),
        body: String::new(),
        url: url.to_string(),
    }
}

pub fn comment_payload(
    module: &str,
    detail: &ChangeDetail,
    body: &str,
    review: Option<Review>,
    url: &str,
) -> Payload {
    Payload::ChangeComment {
        title: format!("{}: {}", module, detail.subject),
        change_state: change_state(&detail.status),
        body: body.to_string(),
        review,
        url: url.to_string(),
    }
}

/// Public URL of a change.
pub fn change_url(host: &str, detail: &ChangeDetail) -> String {
    router::gerrit_change_url(host, &detail.project, detail.number)
}

/// Parse a review vote out of a comment mail's first body line, e.g.
/// "Patch Set 3: Code-Review+2". Returns `None` for plain comments.
pub fn parse_review_vote(first_line: &str) -> Option<Review> {
    let rest = first_line.strip_prefix("Patch Set ")?;
    let (_, votes) = rest.split_once(':')?;

    for token in votes.split_whitespace() {
        let Some(sign_at) = token.rfind(['+', '-']) else {
            continue;
        };
        let (label, score) = token.split_at(sign_at);
        if label.is_empty() {
            continue;
        }
        if let Ok(score) = score.parse::<i32>() {
            return Some(Review {
                label: label.to_string(),
                score,
            });
        }
    }
    None
}

/// Comment text of a Gerrit mail body: everything after the "Patch Set"
/// summary line, unquoted and trimmed.
pub fn comment_text(body: &str) -> String {
    body.lines()
        .skip(1)
        .filter(|line| !line.trim_start().starts_with('>'))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
