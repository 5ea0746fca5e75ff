//! GitHub API boundary.
//!
//! The engine consumes GitHub through the [`GithubApi`] trait: typed detail
//! lookups, the public-events list, and the notifications (unread threads)
//! surface. A thin `reqwest`-backed implementation is provided; tests use
//! in-memory fakes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::activity::readstate::{ReadMarker, UnreadSource};
use crate::activity::{Review, ThreadKey, ThreadKind};
use crate::error::AppError;

/// Issue detail. `is_pull` distinguishes issues that are actually pull
/// requests; comment identities parsed from mail do not know which they are
/// until this lookup.
#[derive(Debug, Clone)]
pub struct IssueDetail {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub state: String,
    pub author: String,
    pub html_url: String,
    pub is_pull: bool,
}

#[derive(Debug, Clone)]
pub struct PullDetail {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub state: String,
    pub merged: bool,
    pub author: String,
    pub html_url: String,
}

#[derive(Debug, Clone)]
pub struct CommentDetail {
    pub id: u64,
    pub body: String,
    pub author: String,
    pub html_url: String,
}

#[derive(Debug, Clone)]
pub struct ReviewDetail {
    pub id: u64,
    pub body: String,
    pub author: String,
    pub state: String,
    pub html_url: String,
}

#[derive(Debug, Clone)]
pub struct CommitDetail {
    pub sha: String,
    pub message: String,
    pub author: String,
}

/// A commit referenced by a push entry; the full message body comes from a
/// separate commit lookup.
#[derive(Debug, Clone)]
pub struct PushCommit {
    pub sha: String,
    pub author: String,
}

/// One entry of the public-events list, flattened to the fields the
/// converter needs.
#[derive(Debug, Clone)]
pub struct EventEntry {
    pub kind: String,
    /// "owner/name"
    pub repo: String,
    pub actor: String,
    pub created_at: DateTime<Utc>,
    pub action: String,
    pub number: Option<u64>,
    pub title: String,
    pub body: String,
    pub state: String,
    pub url: String,
    pub merged: Option<bool>,
    pub review: Option<Review>,
    pub is_pull: bool,
    pub commits: Vec<PushCommit>,
}

/// Events list page plus the provider-advised minimum poll interval.
#[derive(Debug, Clone)]
pub struct EventsPage {
    pub entries: Vec<EventEntry>,
    pub poll_interval: Option<Duration>,
}

#[async_trait]
pub trait GithubApi: Send + Sync {
    async fn issue(&self, repo: &str, number: u64) -> Result<IssueDetail, AppError>;
    async fn pull(&self, repo: &str, number: u64) -> Result<PullDetail, AppError>;
    async fn issue_comment(&self, repo: &str, comment_id: u64) -> Result<CommentDetail, AppError>;
    async fn review(&self, repo: &str, number: u64, review_id: u64)
        -> Result<ReviewDetail, AppError>;
    async fn events(&self, login: &str, window: usize) -> Result<EventsPage, AppError>;
    async fn unread_threads(&self) -> Result<Vec<ThreadKey>, AppError>;
    async fn mark_thread_read(&self, thread: &ThreadKey) -> Result<(), AppError>;
    /// Raw manifest (Cargo.toml) at the repository root, or `None` if the
    /// repository has none.
    async fn manifest(&self, repo: &str) -> Result<Option<String>, AppError>;
    async fn commit(&self, repo: &str, sha: &str) -> Result<CommitDetail, AppError>;
    async fn pull_merged(&self, repo: &str, number: u64) -> Result<bool, AppError>;
}

/// Adapter exposing a [`GithubApi`] as the read-state collaborators.
pub struct GithubReadState(pub Arc<dyn GithubApi>);

#[async_trait]
impl UnreadSource for GithubReadState {
    async fn unread_threads(&self) -> Result<Vec<ThreadKey>, AppError> {
        self.0.unread_threads().await
    }
}

#[async_trait]
impl ReadMarker for GithubReadState {
    async fn propagate_read(&self, thread: &ThreadKey) -> Result<(), AppError> {
        self.0.mark_thread_read(thread).await
    }
}

fn fetch_err(e: reqwest::Error) -> AppError {
    AppError::Fetch(e.to_string())
}

/// `reqwest`-backed [`GithubApi`].
pub struct GithubRest {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl GithubRest {
    pub fn new(base: impl Into<String>, token: Option<String>) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("transom/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(fetch_err)?;
        Ok(Self {
            http,
            base: base.into(),
            token,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .request(method, format!("{}{}", self.base, path))
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, AppError> {
        let resp = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .map_err(fetch_err)?;
        match resp.status() {
            reqwest::StatusCode::NOT_FOUND | reqwest::StatusCode::GONE => {
                Err(AppError::NotFound(path.to_string()))
            }
            status if !status.is_success() => {
                Err(AppError::Fetch(format!("GET {}: {}", path, status)))
            }
            _ => resp.json().await.map_err(fetch_err),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct WireIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    state: String,
    user: WireUser,
    html_url: String,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WirePull {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    state: String,
    #[serde(default)]
    merged: bool,
    user: WireUser,
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct WireComment {
    id: u64,
    #[serde(default)]
    body: Option<String>,
    user: WireUser,
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct WireReview {
    id: u64,
    #[serde(default)]
    body: Option<String>,
    user: WireUser,
    state: String,
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct WireCommit {
    sha: String,
    commit: WireCommitInner,
}

#[derive(Debug, Deserialize)]
struct WireCommitInner {
    message: String,
    author: WireCommitAuthor,
}

#[derive(Debug, Deserialize)]
struct WireCommitAuthor {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: String,
    actor: WireUser,
    repo: WireEventRepo,
    created_at: DateTime<Utc>,
    #[serde(default)]
    payload: WireEventPayload,
}

#[derive(Debug, Deserialize)]
struct WireEventRepo {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireEventPayload {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    issue: Option<WireIssue>,
    #[serde(default)]
    pull_request: Option<WirePull>,
    #[serde(default)]
    comment: Option<WireComment>,
    #[serde(default)]
    review: Option<WireReview>,
    #[serde(default)]
    commits: Vec<WirePushCommit>,
}

#[derive(Debug, Deserialize)]
struct WirePushCommit {
    sha: String,
    author: WirePushAuthor,
}

#[derive(Debug, Deserialize)]
struct WirePushAuthor {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireThread {
    id: String,
    subject: WireSubject,
    repository: WireThreadRepo,
}

#[derive(Debug, Deserialize)]
struct WireSubject {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireThreadRepo {
    full_name: String,
}

/// Map a notifications-API thread subject onto a [`ThreadKey`].
fn thread_key_from_subject(repo_full_name: &str, kind: &str, url: Option<&str>) -> Option<ThreadKey> {
    let kind = match kind {
        "Issue" => ThreadKind::Issue,
        "PullRequest" => ThreadKind::Change,
        _ => return None,
    };
    let id: u64 = url?.rsplit('/').next()?.parse().ok()?;
    Some(ThreadKey::new(
        format!("github.com/{}", repo_full_name),
        kind,
        id,
    ))
}

fn event_entry(e: WireEvent) -> EventEntry {
    let p = e.payload;
    let (number, title, body, state, url, merged, is_pull) = match (&p.issue, &p.pull_request) {
        (_, Some(pr)) => (
            Some(pr.number),
            pr.title.clone(),
            pr.body.clone().unwrap_or_default(),
            pr.state.clone(),
            pr.html_url.clone(),
            Some(pr.merged),
            true,
        ),
        (Some(issue), None) => (
            Some(issue.number),
            issue.title.clone(),
            issue.body.clone().unwrap_or_default(),
            issue.state.clone(),
            issue.html_url.clone(),
            None,
            issue.pull_request.is_some(),
        ),
        (None, None) => (None, String::new(), String::new(), String::new(), String::new(), None, false),
    };

    // A comment or review refines the body and URL of the entry
    let (body, url) = match &p.comment {
        Some(c) => (c.body.clone().unwrap_or_default(), c.html_url.clone()),
        None => (body, url),
    };
    let (review, body, url) = match &p.review {
        Some(r) => (
            Some(Review {
                label: r.state.to_lowercase(),
                score: review_score(&r.state),
            }),
            r.body.clone().unwrap_or_default(),
            r.html_url.clone(),
        ),
        None => (None, body, url),
    };

    EventEntry {
        kind: e.kind,
        repo: e.repo.name,
        actor: e.actor.login,
        created_at: e.created_at,
        action: p.action.unwrap_or_default(),
        number,
        title,
        body,
        state,
        url,
        merged,
        review,
        is_pull,
        commits: p
            .commits
            .into_iter()
            .map(|c| PushCommit {
                sha: c.sha,
                author: c.author.name,
            })
            .collect(),
    }
}

/// Signed score for a GitHub review verdict.
pub fn review_score(state: &str) -> i32 {
    match state.to_lowercase().as_str() {
        "approved" => 1,
        "changes_requested" => -1,
        _ => 0,
    }
}

#[async_trait]
impl GithubApi for GithubRest {
    async fn issue(&self, repo: &str, number: u64) -> Result<IssueDetail, AppError> {
        let w: WireIssue = self
            .get_json(&format!("/repos/{}/issues/{}", repo, number))
            .await?;
        Ok(IssueDetail {
            number: w.number,
            title: w.title,
            body: w.body.unwrap_or_default(),
            state: w.state,
            author: w.user.login,
            html_url: w.html_url,
            is_pull: w.pull_request.is_some(),
        })
    }

    async fn pull(&self, repo: &str, number: u64) -> Result<PullDetail, AppError> {
        let w: WirePull = self
            .get_json(&format!("/repos/{}/pulls/{}", repo, number))
            .await?;
        Ok(PullDetail {
            number: w.number,
            title: w.title,
            body: w.body.unwrap_or_default(),
            state: w.state,
            merged: w.merged,
            author: w.user.login,
            html_url: w.html_url,
        })
    }

    async fn issue_comment(&self, repo: &str, comment_id: u64) -> Result<CommentDetail, AppError> {
        let w: WireComment = self
            .get_json(&format!("/repos/{}/issues/comments/{}", repo, comment_id))
            .await?;
        Ok(CommentDetail {
            id: w.id,
            body: w.body.unwrap_or_default(),
            author: w.user.login,
            html_url: w.html_url,
        })
    }

    async fn review(
        &self,
        repo: &str,
        number: u64,
        review_id: u64,
    ) -> Result<ReviewDetail, AppError> {
        let w: WireReview = self
            .get_json(&format!(
                "/repos/{}/pulls/{}/reviews/{}",
                repo, number, review_id
            ))
            .await?;
        Ok(ReviewDetail {
            id: w.id,
            body: w.body.unwrap_or_default(),
            author: w.user.login,
            state: w.state,
            html_url: w.html_url,
        })
    }

    async fn events(&self, login: &str, window: usize) -> Result<EventsPage, AppError> {
        let path = format!("/users/{}/events?per_page={}", login, window);
        let resp = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(fetch_err)?;
        if !resp.status().is_success() {
            return Err(AppError::Fetch(format!("GET {}: {}", path, resp.status())));
        }
        let poll_interval = resp
            .headers()
            .get("X-Poll-Interval")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let wire: Vec<WireEvent> = resp.json().await.map_err(fetch_err)?;
        Ok(EventsPage {
            entries: wire.into_iter().map(event_entry).collect(),
            poll_interval,
        })
    }

    async fn unread_threads(&self) -> Result<Vec<ThreadKey>, AppError> {
        let wire: Vec<WireThread> = self.get_json("/notifications").await?;
        Ok(wire
            .iter()
            .filter_map(|t| {
                thread_key_from_subject(
                    &t.repository.full_name,
                    &t.subject.kind,
                    t.subject.url.as_deref(),
                )
            })
            .collect())
    }

    async fn mark_thread_read(&self, thread: &ThreadKey) -> Result<(), AppError> {
        // The notifications API is keyed by its own thread ids; resolve by
        // matching the subject against our thread key.
        let wire: Vec<WireThread> = self.get_json("/notifications").await?;
        let Some(entry) = wire.iter().find(|t| {
            thread_key_from_subject(
                &t.repository.full_name,
                &t.subject.kind,
                t.subject.url.as_deref(),
            )
            .as_ref()
                == Some(thread)
        }) else {
            // Already read upstream
            return Ok(());
        };

        let path = format!("/notifications/threads/{}", entry.id);
        let resp = self
            .request(reqwest::Method::PATCH, &path)
            .send()
            .await
            .map_err(fetch_err)?;
        if !resp.status().is_success() {
            return Err(AppError::Fetch(format!("PATCH {}: {}", path, resp.status())));
        }
        Ok(())
    }

    async fn manifest(&self, repo: &str) -> Result<Option<String>, AppError> {
        let path = format!("/repos/{}/contents/Cargo.toml", repo);
        let resp = self
            .request(reqwest::Method::GET, &path)
            .header("Accept", "application/vnd.github.raw+json")
            .send()
            .await
            .map_err(fetch_err)?;
        match resp.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status if !status.is_success() => {
                Err(AppError::Fetch(format!("GET {}: {}", path, status)))
            }
            _ => Ok(Some(resp.text().await.map_err(fetch_err)?)),
        }
    }

    async fn commit(&self, repo: &str, sha: &str) -> Result<CommitDetail, AppError> {
        let w: WireCommit = self
            .get_json(&format!("/repos/{}/commits/{}", repo, sha))
            .await?;
        Ok(CommitDetail {
            sha: w.sha,
            message: w.commit.message,
            author: w.commit.author.name,
        })
    }

    async fn pull_merged(&self, repo: &str, number: u64) -> Result<bool, AppError> {
        Ok(self.pull(repo, number).await?.merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_key_from_issue_subject() {
        let key = thread_key_from_subject(
            "a/b",
            "Issue",
            Some("https://api.github.com/repos/a/b/issues/42"),
        )
        .unwrap();
        assert_eq!(key, ThreadKey::new("github.com/a/b", ThreadKind::Issue, 42));
    }

    #[test]
    fn test_thread_key_from_pull_subject() {
        let key = thread_key_from_subject(
            "a/b",
            "PullRequest",
            Some("https://api.github.com/repos/a/b/pulls/7"),
        )
        .unwrap();
        assert_eq!(key, ThreadKey::new("github.com/a/b", ThreadKind::Change, 7));
    }

    #[test]
    fn test_thread_key_skips_unknown_subjects() {
        assert!(thread_key_from_subject("a/b", "Release", Some("u/1")).is_none());
        assert!(thread_key_from_subject("a/b", "Issue", None).is_none());
    }

    #[test]
    fn test_review_score_mapping() {
        assert_eq!(review_score("APPROVED"), 1);
        assert_eq!(review_score("changes_requested"), -1);
        assert_eq!(review_score("commented"), 0);
    }
}
