//! List-based GitHub source adapter.
//!
//! Periodically pulls the served user's public-events list and converts the
//! entries into own-activity events. Auxiliary lookups (module paths,
//! referenced commit bodies, pull-request merge status) are cached across
//! cycles: each cycle seeds a fresh map from the previous one and drops
//! entries nothing referenced this time.
//!
//! Reader-visible state only changes after a full fetch-and-resolve cycle
//! succeeds; a failed cycle keeps the last-good caches and records the
//! fetch error in the status registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::api::{CommitDetail, GithubApi};
use super::convert;
use crate::activity::service::ActivityService;
use crate::activity::{resolve_module_path, Commit};
use crate::config::LIST_EVENTS_WINDOW;
use crate::error::AppError;
use crate::supervisor::StatusRegistry;

/// Registry key under which this poller reports.
pub const STATUS_TASK: &str = "github-list";

pub struct GithubListPoller {
    api: Arc<dyn GithubApi>,
    service: ActivityService,
    login: String,
    floor: Duration,
    status: StatusRegistry,
    /// sha -> commit detail, carried across cycles
    commits: HashMap<String, CommitDetail>,
    /// repo -> module path
    modules: HashMap<String, String>,
    /// (repo, number) -> merge status
    merged: HashMap<(String, u64), bool>,
}

impl GithubListPoller {
    pub fn new(
        api: Arc<dyn GithubApi>,
        service: ActivityService,
        login: impl Into<String>,
        floor: Duration,
        status: StatusRegistry,
    ) -> Self {
        Self {
            api,
            service,
            login: login.into(),
            floor,
            status,
            commits: HashMap::new(),
            modules: HashMap::new(),
            merged: HashMap::new(),
        }
    }

    /// Poll loop, pacing itself by the provider-advised interval floored to
    /// the configured minimum.
    pub async fn run(mut self) -> Result<(), AppError> {
        let mut interval = self.floor;
        loop {
            match self.poll_once().await {
                Ok((count, advised)) => {
                    if count > 0 {
                        tracing::debug!(count, "Merged own-activity events");
                    }
                    self.status.set(STATUS_TASK, "ok").await;
                    if let Some(advised) = advised {
                        interval = advised.max(self.floor);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Events poll failed, keeping last-good state");
                    self.status
                        .set(STATUS_TASK, format!("last error: {}", e))
                        .await;
                }
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// One fetch-and-resolve cycle. Returns the number of merged events and
    /// the provider-advised poll interval.
    pub async fn poll_once(&mut self) -> Result<(usize, Option<Duration>), AppError> {
        let page = self.api.events(&self.login, LIST_EVENTS_WINDOW).await?;

        let mut next_commits: HashMap<String, CommitDetail> = HashMap::new();
        let mut next_modules: HashMap<String, String> = HashMap::new();
        let mut next_merged: HashMap<(String, u64), bool> = HashMap::new();
        let mut events = Vec::new();

        for entry in &page.entries {
            if entry.actor != self.login {
                continue;
            }

            let module = match next_modules.get(&entry.repo) {
                Some(m) => m.clone(),
                None => {
                    let module = match self.modules.get(&entry.repo) {
                        Some(m) => m.clone(),
                        None => {
                            let manifest = self.api.manifest(&entry.repo).await?;
                            resolve_module_path(
                                manifest.as_deref(),
                                &convert::namespace(&entry.repo),
                            )
                        }
                    };
                    next_modules.insert(entry.repo.clone(), module.clone());
                    module
                }
            };

            let merged = match (entry.merged, entry.number) {
                (Some(m), Some(number)) => {
                    next_merged.insert((entry.repo.clone(), number), m);
                    m
                }
                (None, Some(number)) if entry.is_pull => {
                    let key = (entry.repo.clone(), number);
                    let m = match next_merged.get(&key).or_else(|| self.merged.get(&key)) {
                        Some(&m) => m,
                        None => self.api.pull_merged(&entry.repo, number).await?,
                    };
                    next_merged.insert(key, m);
                    m
                }
                _ => false,
            };

            let mut commits = Vec::new();
            for push_commit in &entry.commits {
                let detail = match next_commits
                    .get(&push_commit.sha)
                    .or_else(|| self.commits.get(&push_commit.sha))
                {
                    Some(d) => d.clone(),
                    None => match self.api.commit(&entry.repo, &push_commit.sha).await {
                        Ok(d) => d,
                        Err(e) if e.is_not_found() => {
                            tracing::info!(
                                sha = %push_commit.sha,
                                "Referenced commit is gone, skipping"
                            );
                            continue;
                        }
                        Err(e) => return Err(e),
                    },
                };
                next_commits.insert(push_commit.sha.clone(), detail.clone());
                commits.push(Commit {
                    sha: detail.sha,
                    message: detail.message,
                    author: detail.author,
                });
            }

            if let Some(event) = convert::event_from_entry(entry, &module, merged, commits) {
                events.push(event);
            }
        }

        // Full cycle succeeded: adopt the reseeded caches, dropping entries
        // no longer referenced, and publish the events.
        self.commits = next_commits;
        self.modules = next_modules;
        self.merged = next_merged;

        let count = events.len();
        self.service.merge_events(events).await;
        Ok((count, page.poll_interval))
    }
}
