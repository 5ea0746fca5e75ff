//! Public HTML URL construction.
//!
//! Pure mapping from resolved items and server identifiers to the URLs
//! surfaced in payloads. Detail services usually supply their own URLs;
//! these builders cover providers and entries that do not.

/// Issue page, e.g. `https://github.com/owner/repo/issues/42`.
pub fn github_issue_url(namespace: &str, number: u64) -> String {
    format!("https://{}/issues/{}", namespace, number)
}

/// Pull request page, e.g. `https://github.com/owner/repo/pull/7`.
pub fn github_pull_url(namespace: &str, number: u64) -> String {
    format!("https://{}/pull/{}", namespace, number)
}

/// Issue comment anchor on its issue page.
pub fn github_comment_url(namespace: &str, number: u64, comment_id: u64) -> String {
    format!(
        "https://{}/issues/{}#issuecomment-{}",
        namespace, number, comment_id
    )
}

/// Gerrit change page, e.g. `https://review.example.org/c/project/+/4042`.
pub fn gerrit_change_url(host: &str, project: &str, number: u64) -> String {
    format!("https://{}/c/{}/+/{}", host, project, number)
}
