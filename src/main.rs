use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use webpilot::api;
use webpilot::config::Config;
use webpilot::events::Notifier;
use webpilot::orchestrator::Orchestrator;
use webpilot::scheduler::Scheduler;
use webpilot::store::{Database, LibSqlBackend};
use webpilot::supervisor::WorkerSupervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    // Logs go to stderr and a daily-rolling file. The appender guard must
    // stay alive for the life of the process or buffered lines are lost.
    std::fs::create_dir_all(&config.log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "webpilot.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    eprintln!("🌐 WebPilot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Dashboard WS: ws://{}/ws", config.bind_addr);
    eprintln!("   REST API: http://{}/api/tasks", config.bind_addr);
    eprintln!("   Worker: {}", config.worker_cmd.join(" "));

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Orchestrator & Scheduler ─────────────────────────────────────────
    let notifier = Notifier::new();
    let (run_finished_tx, run_finished_rx) = tokio::sync::mpsc::unbounded_channel();

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&db),
        WorkerSupervisor::new(config.worker_cmd.clone()),
        notifier.clone(),
        run_finished_tx,
    ));

    let scheduler = Scheduler::new(
        Arc::clone(&db),
        Arc::clone(&orchestrator),
        notifier.clone(),
        config.guard_cmd.clone(),
    );
    scheduler.start(run_finished_rx).await;

    // ── Dashboard server ─────────────────────────────────────────────────
    let app = api::routes(
        Arc::clone(&orchestrator),
        Arc::clone(&scheduler),
        notifier.clone(),
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "Dashboard server started");

    // Serve until ctrl-c, then stop timers and release the sleep guard.
    let shutdown_scheduler = Arc::clone(&scheduler);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            eprintln!("\nShutting down");
            shutdown_scheduler.stop().await;
        })
        .await?;

    Ok(())
}
