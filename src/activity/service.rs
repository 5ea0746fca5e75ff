//! Service facade over the shared aggregation state.
//!
//! Poll tasks are the only writers of the caches they own; API callers read
//! and mark under short lock-scoped critical sections. The data lock and the
//! subscriber registry lock are disjoint, and no network call is made while
//! holding either: mark-read propagation is queued to a background drain
//! task, and reconciliation/detail fetches happen before their merge
//! sections. Read-state is always updated before the corresponding delta is
//! pushed to the broadcaster.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use super::broadcast::{Broadcaster, Subscription};
use super::cache::RecencyCache;
use super::readstate::{ReadMarker, ReadStateTracker, UnreadSource};
use super::{Event, Notification, ThreadKey};
use crate::config::{MARK_READ_QUEUE_CAPACITY, RECENT_CACHE_CAP};
use crate::error::AppError;
use crate::supervisor::StatusRegistry;
use crate::users::{UserSpec, Users};

/// Options for listing notifications.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Restrict results to one namespace
    pub namespace: Option<String>,
    /// Include read notifications as well
    pub all: bool,
}

/// Operational counters for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub notifications: usize,
    pub events: usize,
    pub unread_threads: u64,
    pub subscribers: usize,
}

struct Shared {
    notifications: RecencyCache<Notification>,
    events: RecencyCache<Event>,
    read: ReadStateTracker,
    subscribed: HashSet<ThreadKey>,
}

/// The aggregation service: notification inbox plus own-activity feed.
#[derive(Clone)]
pub struct ActivityService {
    users: Users,
    shared: Arc<Mutex<Shared>>,
    broadcaster: Arc<Broadcaster<Notification>>,
    mark_tx: async_channel::Sender<ThreadKey>,
    mark_rx: async_channel::Receiver<ThreadKey>,
    status: StatusRegistry,
}

impl ActivityService {
    pub fn new(users: Users, read: ReadStateTracker, status: StatusRegistry) -> Self {
        let (mark_tx, mark_rx) = async_channel::bounded(MARK_READ_QUEUE_CAPACITY);
        Self {
            users,
            shared: Arc::new(Mutex::new(Shared {
                notifications: RecencyCache::new(RECENT_CACHE_CAP),
                events: RecencyCache::new(RECENT_CACHE_CAP),
                read,
                subscribed: HashSet::new(),
            })),
            broadcaster: Arc::new(Broadcaster::new()),
            mark_tx,
            mark_rx,
            status,
        }
    }

    /// The user this service aggregates for.
    pub fn served_user(&self) -> &UserSpec {
        self.users.served()
    }

    /// List notifications, newest first, with read state applied.
    pub async fn list_notifications(
        &self,
        caller: &UserSpec,
        opts: &ListOptions,
    ) -> Result<Vec<Notification>, AppError> {
        self.users.authorize(caller)?;
        let shared = self.shared.lock().await;
        let latest = latest_times(&shared.notifications);

        let result = shared
            .notifications
            .items()
            .iter()
            .filter(|n| match &opts.namespace {
                Some(ns) => n.thread.namespace == *ns,
                None => true,
            })
            .map(|n| {
                let mut n = n.clone();
                n.unread = shared.read.is_unread(&n.thread, latest[&n.thread]);
                n
            })
            .filter(|n| opts.all || n.unread)
            .collect();
        Ok(result)
    }

    /// Number of unread threads.
    pub async fn count_notifications(&self, caller: &UserSpec) -> Result<u64, AppError> {
        self.users.authorize(caller)?;
        let shared = self.shared.lock().await;
        let latest = latest_times(&shared.notifications);
        let count = latest
            .iter()
            .filter(|(thread, &time)| shared.read.is_unread(thread, time))
            .count();
        Ok(count as u64)
    }

    /// Register a streaming subscriber. Delivery happens asynchronously from
    /// the poll tasks; this returns immediately.
    pub async fn stream_notifications(
        &self,
        caller: &UserSpec,
        tx: mpsc::Sender<Vec<Notification>>,
    ) -> Result<Subscription, AppError> {
        self.users.authorize(caller)?;
        Ok(self.broadcaster.subscribe(tx).await)
    }

    /// Mark a thread read. The local mark takes effect immediately;
    /// propagation to the provider is queued and best-effort.
    pub async fn mark_thread_read(
        &self,
        caller: &UserSpec,
        thread: &ThreadKey,
    ) -> Result<(), AppError> {
        self.users.authorize(caller)?;
        let now = Utc::now();

        let deltas = {
            let mut shared = self.shared.lock().await;
            shared.read.mark_read(thread, now);
            read_deltas(&shared.notifications, std::slice::from_ref(thread))
        };
        self.broadcaster.send(&deltas).await;

        if let Err(e) = self.mark_tx.try_send(thread.clone()) {
            tracing::warn!(
                %thread,
                error = %e,
                "Mark-read propagation queue full; local mark stands"
            );
        }
        Ok(())
    }

    /// Subscribe the served user to a thread; future activity on it from
    /// other users becomes a notification via [`notify_thread`].
    ///
    /// [`notify_thread`]: ActivityService::notify_thread
    pub async fn subscribe_thread(
        &self,
        caller: &UserSpec,
        thread: ThreadKey,
    ) -> Result<(), AppError> {
        self.users.authorize(caller)?;
        self.shared.lock().await.subscribed.insert(thread);
        Ok(())
    }

    /// Report activity on a subscribed thread. Activity by the served user
    /// or on an unsubscribed thread is ignored.
    pub async fn notify_thread(
        &self,
        caller: &UserSpec,
        notification: Notification,
    ) -> Result<(), AppError> {
        self.users.authorize(caller)?;
        if notification.actor == self.users.served().login {
            return Ok(());
        }
        {
            let shared = self.shared.lock().await;
            if !shared.subscribed.contains(&notification.thread) {
                return Ok(());
            }
        }
        self.merge_notifications(vec![notification]).await;
        Ok(())
    }

    /// List the served user's own recent activity, newest first.
    pub async fn list_events(&self, caller: &UserSpec) -> Result<Vec<Event>, AppError> {
        self.users.authorize(caller)?;
        Ok(self.shared.lock().await.events.items().to_vec())
    }

    /// Record an own-activity event. No authorization: the event sources
    /// themselves call this.
    pub async fn log_event(&self, event: Event) {
        self.merge_events(vec![event]).await;
    }

    /// Per-task status strings.
    pub async fn status(&self) -> std::collections::BTreeMap<String, String> {
        self.status.snapshot().await
    }

    /// Operational counters, no authorization (process-local surface).
    pub async fn stats(&self) -> StatsSnapshot {
        let shared = self.shared.lock().await;
        let latest = latest_times(&shared.notifications);
        let unread_threads = latest
            .iter()
            .filter(|(thread, &time)| shared.read.is_unread(thread, time))
            .count() as u64;
        StatsSnapshot {
            notifications: shared.notifications.len(),
            events: shared.events.len(),
            unread_threads,
            subscribers: self.broadcaster.subscriber_count().await,
        }
    }

    /// Merge freshly converted notifications and fan them out unread.
    /// Adapters call this once per successful batch.
    pub async fn merge_notifications(&self, mut batch: Vec<Notification>) {
        if batch.is_empty() {
            return;
        }
        for n in &mut batch {
            n.unread = true;
        }
        {
            let mut shared = self.shared.lock().await;
            shared.notifications.merge(batch.clone());
        }
        self.broadcaster.send(&batch).await;
    }

    /// Merge freshly converted own-activity events.
    pub async fn merge_events(&self, batch: Vec<Event>) {
        if batch.is_empty() {
            return;
        }
        self.shared.lock().await.events.merge(batch);
    }

    /// Replace predicted read state with the authoritative unread set and
    /// fan out became-read transitions.
    pub async fn apply_reconciliation(&self, unread: HashSet<ThreadKey>) -> usize {
        let now = Utc::now();
        let deltas = {
            let mut shared = self.shared.lock().await;
            let became_read = shared.read.reconcile(unread, now);
            read_deltas(&shared.notifications, &became_read)
        };
        let count = deltas.len();
        self.broadcaster.send(&deltas).await;
        count
    }

    /// Write the read-state checkpoint.
    pub async fn checkpoint_to<P: AsRef<Path>>(&self, path: P) -> Result<(), AppError> {
        let contents = {
            let shared = self.shared.lock().await;
            shared.read.checkpoint()?
        };
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Receiver side of the mark-read propagation queue.
    pub fn mark_read_queue(&self) -> async_channel::Receiver<ThreadKey> {
        self.mark_rx.clone()
    }
}

/// Most recent notification time per thread. Items are sorted descending,
/// so the first occurrence wins.
fn latest_times(cache: &RecencyCache<Notification>) -> HashMap<ThreadKey, DateTime<Utc>> {
    let mut latest = HashMap::new();
    for n in cache.items() {
        latest.entry(n.thread.clone()).or_insert(n.time);
    }
    latest
}

/// Cached notifications for the given threads, re-sent with `unread: false`.
/// Threads that have aged out of the cache produce no delta.
fn read_deltas(cache: &RecencyCache<Notification>, threads: &[ThreadKey]) -> Vec<Notification> {
    cache
        .items()
        .iter()
        .filter(|n| threads.contains(&n.thread))
        .map(|n| {
            let mut n = n.clone();
            n.unread = false;
            n
        })
        .collect()
}

/// Drain the mark-read propagation queue. Failures are logged; the
/// optimistic local mark stands either way.
pub async fn run_mark_read_drain(
    marker: Arc<dyn ReadMarker>,
    rx: async_channel::Receiver<ThreadKey>,
) -> Result<(), AppError> {
    while let Ok(thread) = rx.recv().await {
        match marker.propagate_read(&thread).await {
            Ok(()) => tracing::debug!(%thread, "Propagated read mark"),
            Err(e) => tracing::warn!(
                %thread,
                error = %e,
                "Mark-read propagation failed; local mark stands"
            ),
        }
    }
    Ok(())
}

/// Periodically poll the authoritative unread list and reconcile.
pub async fn run_reconciler(
    service: ActivityService,
    source: Arc<dyn UnreadSource>,
    interval: Duration,
) -> Result<(), AppError> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match source.unread_threads().await {
            Ok(threads) => {
                let became_read = service
                    .apply_reconciliation(threads.into_iter().collect())
                    .await;
                if became_read > 0 {
                    tracing::debug!(became_read, "Reconciled read state");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Unread-list poll failed, keeping previous state");
            }
        }
    }
}

/// Periodically write the read-state checkpoint.
pub async fn run_checkpointer(
    service: ActivityService,
    path: PathBuf,
    interval: Duration,
) -> Result<(), AppError> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so startup does not rewrite
    // the file it just loaded.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = service.checkpoint_to(&path).await {
            tracing::warn!(error = %e, path = %path.display(), "Checkpoint write failed");
        } else {
            tracing::debug!(path = %path.display(), "Wrote read-state checkpoint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{Payload, ThreadKind};
    use chrono::TimeZone;

    fn users() -> Users {
        Users::new(UserSpec::new("alice", "github.com"))
    }

    fn alice() -> UserSpec {
        UserSpec::new("alice", "github.com")
    }

    fn service() -> ActivityService {
        ActivityService::new(users(), ReadStateTracker::new(), StatusRegistry::new())
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn notification(ns: &str, id: u64, secs: i64, actor: &str) -> Notification {
        Notification {
            thread: ThreadKey::new(ns, ThreadKind::Issue, id),
            import_paths: vec![ns.to_string()],
            time: at(secs),
            actor: actor.to_string(),
            payload: Payload::Issue {
                action: "opened".to_string(),
                title: "broken build".to_string(),
                body: String::new(),
                url: format!("https://{}/issues/{}", ns, id),
            },
            unread: true,
            participating: false,
            mentioned: false,
        }
    }

    #[tokio::test]
    async fn test_permission_denied_for_other_caller() {
        let svc = service();
        let mallory = UserSpec::new("mallory", "github.com");
        let err = svc
            .list_notifications(&mallory, &ListOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Permission { .. }));
    }

    #[tokio::test]
    async fn test_mark_read_scenario() {
        let svc = service();
        svc.merge_notifications(vec![notification("github.com/a/b", 42, 10, "bob")])
            .await;

        let listed = svc
            .list_notifications(&alice(), &ListOptions::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].unread);

        let thread = ThreadKey::new("github.com/a/b", ThreadKind::Issue, 42);
        svc.mark_thread_read(&alice(), &thread).await.unwrap();

        // Unread-only view excludes the thread
        let unread_only = svc
            .list_notifications(
                &alice(),
                &ListOptions {
                    namespace: Some("github.com/a/b".to_string()),
                    all: false,
                },
            )
            .await
            .unwrap();
        assert!(unread_only.is_empty());

        // The all view still includes it, now read
        let all = svc
            .list_notifications(
                &alice(),
                &ListOptions {
                    namespace: Some("github.com/a/b".to_string()),
                    all: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert!(!all[0].unread);

        assert_eq!(svc.count_notifications(&alice()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_count_counts_unread_threads() {
        let svc = service();
        svc.merge_notifications(vec![
            notification("github.com/a/b", 1, 10, "bob"),
            notification("github.com/a/b", 1, 20, "carol"),
            notification("github.com/a/b", 2, 30, "bob"),
        ])
        .await;
        // Two threads, one with two notifications
        assert_eq!(svc.count_notifications(&alice()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stream_receives_merged_batch() {
        let svc = service();
        let (tx, mut rx) = mpsc::channel(4);
        let _sub = svc.stream_notifications(&alice(), tx).await.unwrap();

        svc.merge_notifications(vec![notification("github.com/a/b", 7, 10, "bob")])
            .await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch[0].unread);
    }

    #[tokio::test]
    async fn test_reconciliation_emits_read_deltas() {
        let svc = service();
        svc.merge_notifications(vec![
            notification("github.com/a/b", 1, 10, "bob"),
            notification("github.com/a/b", 2, 20, "bob"),
        ])
        .await;

        let t1 = ThreadKey::new("github.com/a/b", ThreadKind::Issue, 1);
        let t2 = ThreadKey::new("github.com/a/b", ThreadKind::Issue, 2);
        svc.apply_reconciliation([t1.clone(), t2.clone()].into_iter().collect())
            .await;

        let (tx, mut rx) = mpsc::channel(4);
        let _sub = svc.stream_notifications(&alice(), tx).await.unwrap();

        // Authority now says thread 1 is read
        let deltas = svc
            .apply_reconciliation([t2.clone()].into_iter().collect())
            .await;
        assert_eq!(deltas, 1);
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch[0].thread, t1);
        assert!(!batch[0].unread);

        assert_eq!(svc.count_notifications(&alice()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_notify_thread_requires_subscription() {
        let svc = service();
        let n = notification("github.com/a/b", 5, 10, "bob");
        svc.notify_thread(&alice(), n.clone()).await.unwrap();
        assert_eq!(
            svc.count_notifications(&alice()).await.unwrap(),
            0,
            "unsubscribed thread must not notify"
        );

        svc.subscribe_thread(&alice(), n.thread.clone()).await.unwrap();
        svc.notify_thread(&alice(), n).await.unwrap();
        assert_eq!(svc.count_notifications(&alice()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_notify_thread_ignores_own_activity() {
        let svc = service();
        let n = notification("github.com/a/b", 5, 10, "alice");
        svc.subscribe_thread(&alice(), n.thread.clone()).await.unwrap();
        svc.notify_thread(&alice(), n).await.unwrap();
        assert_eq!(svc.count_notifications(&alice()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_log_event_needs_no_auth() {
        let svc = service();
        svc.log_event(Event {
            namespace: "github.com/a/b".to_string(),
            time: at(10),
            actor: "alice".to_string(),
            payload: crate::activity::EventPayload::Thread(Payload::Issue {
                action: "opened".to_string(),
                title: "t".to_string(),
                body: String::new(),
                url: String::new(),
            }),
        })
        .await;
        assert_eq!(svc.list_events(&alice()).await.unwrap().len(), 1);
    }
}
