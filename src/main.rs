use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gridwatch_service::{
    alerts::{AlertEngine, Notifier},
    api::{self, AppState},
    cache,
    config::Config,
    db,
    ingest::IngestService,
    poller::Orchestrator,
    realtime::FanoutHub,
    repo::{memory::MemoryRepository, postgres::PgRepository, AuditSink, DeviceRepository},
    scoring::ScoringEngine,
    upstream::UpstreamClient,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env (ignore error if file absent — env vars may be set externally)
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;

    // Storage: Postgres when DATABASE_URL is set, otherwise the in-memory
    // repository (useful for local development; nothing survives a restart).
    let (pool, repo, audit): (_, Arc<dyn DeviceRepository>, Arc<dyn AuditSink>) =
        match config.database_url {
            Some(ref url) => {
                let pool = db::create_pool(url).await?;
                db::run_migrations(&pool).await?;
                info!("Database ready");
                let repo = Arc::new(PgRepository::new(pool.clone()));
                (Some(pool), repo.clone(), repo)
            }
            None => {
                warn!("DATABASE_URL not set; running with in-memory storage");
                let repo = Arc::new(MemoryRepository::new());
                (None, repo.clone(), repo)
            }
        };

    let cache = cache::from_config(&config, pool.as_ref())?;
    let upstream = Arc::new(UpstreamClient::new(&config)?);
    let hub = FanoutHub::new(
        config.max_connections,
        config.connection_queue_capacity,
        Duration::from_secs(config.heartbeat_secs),
    );

    let alerts = AlertEngine::new(repo.clone(), audit, Notifier::new()?);
    let scoring = ScoringEngine::new(repo.clone(), &config);
    let ingest = Arc::new(IngestService::new(
        repo.clone(),
        alerts.clone(),
        scoring,
        hub.clone(),
    ));

    // Background tasks: polling, retention cleanup, heartbeat sweep.
    let orchestrator = Arc::new(Orchestrator::new(
        repo.clone(),
        upstream.clone(),
        ingest.clone(),
        alerts.clone(),
        hub.clone(),
        cache.clone(),
        config.clone(),
    ));
    tokio::spawn(orchestrator.clone().run());
    tokio::spawn(orchestrator.run_cleanup_loop());
    tokio::spawn(hub.clone().run_sweeper());
    info!(
        interval_secs = config.poll_interval_secs,
        concurrency = config.poll_concurrency,
        "polling loop started"
    );

    let state = AppState {
        repo,
        cache,
        hub,
        ingest,
        alerts,
        upstream,
    };

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
