//! Gerrit API boundary.
//!
//! Change detail lookups behind the [`GerritApi`] trait, with a thin
//! `reqwest`-backed implementation. Gerrit prefixes JSON responses with a
//! XSSI guard line that must be stripped before decoding.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::AppError;

/// Resolved change detail.
#[derive(Debug, Clone)]
pub struct ChangeDetail {
    pub number: u64,
    pub project: String,
    pub subject: String,
    /// "NEW", "MERGED", or "ABANDONED"
    pub status: String,
    /// Username of the change owner
    pub owner: String,
    /// Usernames of current reviewers
    pub reviewers: Vec<String>,
}

#[async_trait]
pub trait GerritApi: Send + Sync {
    async fn change(&self, number: u64) -> Result<ChangeDetail, AppError>;
}

fn fetch_err(e: reqwest::Error) -> AppError {
    AppError::Fetch(e.to_string())
}

/// `reqwest`-backed [`GerritApi`].
pub struct GerritRest {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl GerritRest {
    /// `host` is the bare server host, e.g. "review.example.org".
    pub fn new(host: &str, token: Option<String>) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("transom/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(fetch_err)?;
        Ok(Self {
            http,
            base: format!("https://{}", host),
            token,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireAccount {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

impl WireAccount {
    fn ident(&self) -> String {
        self.username
            .clone()
            .or_else(|| self.name.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct WireChange {
    #[serde(rename = "_number")]
    number: u64,
    project: String,
    subject: String,
    status: String,
    owner: WireAccount,
    #[serde(default)]
    reviewers: HashMap<String, Vec<WireAccount>>,
}

/// Strip Gerrit's `)]}'` XSSI guard line.
fn strip_xssi_guard(body: &str) -> &str {
    match body.split_once('\n') {
        Some((first, rest)) if first.starts_with(")]}'") => rest,
        _ => body,
    }
}

#[async_trait]
impl GerritApi for GerritRest {
    async fn change(&self, number: u64) -> Result<ChangeDetail, AppError> {
        let prefix = if self.token.is_some() { "/a" } else { "" };
        let path = format!("{}/changes/{}/detail", prefix, number);
        let mut req = self.http.get(format!("{}{}", self.base, path));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(fetch_err)?;
        match resp.status() {
            reqwest::StatusCode::NOT_FOUND => return Err(AppError::NotFound(path)),
            status if !status.is_success() => {
                return Err(AppError::Fetch(format!("GET {}: {}", path, status)))
            }
            _ => {}
        }
        let body = resp.text().await.map_err(fetch_err)?;
        let wire: WireChange = serde_json::from_str(strip_xssi_guard(&body))?;

        Ok(ChangeDetail {
            number: wire.number,
            project: wire.project,
            subject: wire.subject,
            status: wire.status,
            owner: wire.owner.ident(),
            reviewers: wire
                .reviewers
                .get("REVIEWER")
                .map(|accounts| accounts.iter().map(WireAccount::ident).collect())
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_xssi_guard() {
        let body = ")]}'\n{\"_number\": 7}";
        assert_eq!(strip_xssi_guard(body), "{\"_number\": 7}");
        assert_eq!(strip_xssi_guard("{\"a\": 1}"), "{\"a\": 1}");
    }

    #[test]
    fn test_wire_change_decodes() {
        let raw = r#"{
            "_number": 4042,
            "project": "tools",
            "subject": "maillog: resume partial segments",
            "status": "NEW",
            "owner": {"username": "alice", "name": "Alice Smith"},
            "reviewers": {"REVIEWER": [{"username": "bob"}, {"name": "Carol"}]}
        }"#;
        let wire: WireChange = serde_json::from_str(raw).unwrap();
        assert_eq!(wire.number, 4042);
        assert_eq!(wire.owner.ident(), "alice");
        let reviewers: Vec<String> = wire.reviewers["REVIEWER"].iter().map(WireAccount::ident).collect();
        assert_eq!(reviewers, vec!["bob", "Carol"]);
    }
}
