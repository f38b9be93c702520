use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use practice_scheduler::api::{self, AppState};
use practice_scheduler::config::AppConfig;
use practice_scheduler::jobs::{JobService, spawn_local_timer};
use practice_scheduler::notify::{ChannelDispatcher, NotificationDispatcher, WebhookDispatcher};
use practice_scheduler::schedule::{Scheduler, TaskLifecycle, TemplateCatalog};
use practice_scheduler::store::{Database, LibSqlBackend};
use practice_scheduler::streaks::{HabitTracker, StreakEngine};

/// Console logging, plus a daily rolling file when a log directory is set.
/// The returned guard must live as long as the process.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "practice-scheduler.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    guard
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("Practice scheduler v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Triggers: http://0.0.0.0:{}/api/cron/*", config.port);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);

    // ── Template catalog ─────────────────────────────────────────────────
    let catalog = match &config.schedule.catalog_path {
        Some(path) => TemplateCatalog::load(path)?,
        None => TemplateCatalog::builtin(),
    };

    // ── Notifications ────────────────────────────────────────────────────
    let dispatcher: Arc<dyn NotificationDispatcher> = match &config.notify_webhook_url {
        Some(url) => {
            info!(url = %url, "Notifications go to webhook");
            Arc::new(WebhookDispatcher::new(url.clone())?)
        }
        None => {
            let (dispatcher, mut rx) = ChannelDispatcher::channel(256);
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    info!(kind = event.kind(), habit_id = %event.habit_id(), "Notification");
                }
            });
            Arc::new(dispatcher)
        }
    };

    // ── Services ─────────────────────────────────────────────────────────
    let workers = config.jobs.max_workers;
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&db),
        Arc::new(catalog),
        config.schedule.clone(),
        workers,
    ));
    let streaks = Arc::new(StreakEngine::new(
        Arc::clone(&db),
        Arc::clone(&dispatcher),
        config.streaks.clone(),
        workers,
    ));
    let lifecycle = Arc::new(TaskLifecycle::new(Arc::clone(&db)));
    let tracker = Arc::new(HabitTracker::new(
        Arc::clone(&db),
        dispatcher,
        config.streaks.clone(),
    ));
    let jobs = Arc::new(JobService::new(
        Arc::clone(&db),
        Arc::clone(&scheduler),
        streaks,
        Arc::clone(&lifecycle),
        config.jobs.clone(),
        config.schedule.clone(),
    ));

    // ── Local timer (off unless PRACTICE_LOCAL_TIMER is set) ─────────────
    let timers = spawn_local_timer(Arc::clone(&jobs), &config.timer)?;
    if !timers.is_empty() {
        eprintln!("   Local timer: {} jobs armed", timers.len());
    }

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api::router(AppState {
        jobs,
        scheduler,
        lifecycle,
        tracker,
        cron_secret: config.cron_secret.clone(),
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!(port = config.port, "Listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for handle in timers {
        handle.abort();
    }
    Ok(())
}
