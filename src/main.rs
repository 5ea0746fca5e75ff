//! Transom: single-user activity and notification aggregation daemon.
//!
//! This is the application entry point. It initializes tracing, loads
//! configuration from TOML, restores the read-state checkpoint, spawns the
//! supervised poll tasks (mail walkers, list poller, reconciler, mark-read
//! drain, checkpointer), and serves the status HTTP endpoint until ctrl-c,
//! writing a final checkpoint on the way out.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use transom::activity::readstate::ReadStateTracker;
use transom::activity::service::{
    run_checkpointer, run_mark_read_drain, run_reconciler, ActivityService,
};
use transom::config::{AppConfig, DEFAULT_CONFIG_PATH, DEFAULT_LOG_FILTER, RECONCILE_INTERVAL_SECS};
use transom::gerrit::{GerritMailAdapter, GerritRest};
use transom::github::{GithubListPoller, GithubMailAdapter, GithubReadState, GithubRest};
use transom::maillog::FsMailStore;
use transom::supervisor::{supervise, StatusRegistry};
use transom::users::{UserSpec, Users};

/// Transom: activity and notification aggregation for GitHub and Gerrit
#[derive(Parser, Debug)]
#[command(name = "transom", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level filter (e.g., "transom=debug,tower_http=info")
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration first; the log format depends on it
    let config = AppConfig::load(&args.config)?;

    // Filter priority: CLI > env > default
    let log_filter = args
        .log_level
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

    let registry = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_filter));
    if config.logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!(user = %config.user.login, "Loaded configuration");

    // Restore read state from the checkpoint, if any
    let checkpoint_path = PathBuf::from(&config.readstate.checkpoint_path);
    let tracker = match ReadStateTracker::load(&checkpoint_path) {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(error = %e, "Could not load read-state checkpoint, starting empty");
            ReadStateTracker::new()
        }
    };

    let users = Users::new(UserSpec::new(config.user.login.clone(), "github.com"));
    let status = StatusRegistry::new();
    let service = ActivityService::new(users, tracker, status.clone());

    let store = Arc::new(FsMailStore::new(&config.mail.dir));
    let github: Arc<GithubRest> = Arc::new(GithubRest::new(
        config.github.api_base.clone(),
        config.github.token.clone(),
    )?);

    // Mail walker: GitHub
    let github_mail = GithubMailAdapter::new(
        store.clone(),
        github.clone(),
        service.clone(),
        config.user.login.clone(),
    );
    let mut wakes = vec![github_mail.wake_handle()];
    supervise(&status, "github-mail", github_mail.run());

    // Mail walker: Gerrit, when configured
    if let Some(gerrit_config) = &config.gerrit {
        let gerrit: Arc<GerritRest> = Arc::new(GerritRest::new(
            &gerrit_config.host,
            gerrit_config.token.clone(),
        )?);
        let gerrit_mail = GerritMailAdapter::new(
            store.clone(),
            gerrit,
            service.clone(),
            gerrit_config.host.clone(),
            config.gerrit_username(),
        );
        wakes.push(gerrit_mail.wake_handle());
        supervise(&status, "gerrit-mail", gerrit_mail.run());
    }

    // Wake the mail walkers periodically
    let wake_interval = config.mail.wake_interval();
    supervise(&status, "mail-wake", async move {
        loop {
            tokio::time::sleep(wake_interval).await;
            for wake in &wakes {
                wake.notify_one();
            }
        }
    });

    // List poller for own activity
    let poller = GithubListPoller::new(
        github.clone(),
        service.clone(),
        config.user.login.clone(),
        config.github.poll_floor(),
        status.clone(),
    );
    supervise(&status, "github-list", poller.run());

    // Read-state reconciliation against the authoritative unread list
    supervise(
        &status,
        "reconciler",
        run_reconciler(
            service.clone(),
            Arc::new(GithubReadState(github.clone())),
            Duration::from_secs(RECONCILE_INTERVAL_SECS),
        ),
    );

    // Mark-read propagation drain
    supervise(
        &status,
        "mark-read",
        run_mark_read_drain(
            Arc::new(GithubReadState(github.clone())),
            service.mark_read_queue(),
        ),
    );

    // Periodic read-state checkpoints
    supervise(
        &status,
        "checkpoint",
        run_checkpointer(
            service.clone(),
            checkpoint_path.clone(),
            config.readstate.checkpoint_interval(),
        ),
    );

    // Status HTTP surface
    let app = transom::http::router(service.clone());
    let addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port).parse()?;
    tracing::info!("Serving status endpoint at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    // Final checkpoint on graceful shutdown
    if let Err(e) = service.checkpoint_to(&checkpoint_path).await {
        tracing::warn!(error = %e, "Final checkpoint write failed");
    } else {
        tracing::info!(path = %checkpoint_path.display(), "Wrote final read-state checkpoint");
    }

    Ok(())
}
