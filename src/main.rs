//! Binary entry point (§5 Startup/Shutdown): load configuration, open the
//! store, wire the collaborator services, recover from a prior crash, then
//! serve the HTTP/WebSocket API until a shutdown signal arrives.

use std::sync::Arc;
use std::time::Duration;

use climpire_lib::api::{self, AppState};
use climpire_lib::bus::EventBus;
use climpire_lib::config::Config;
use climpire_lib::db::Database;
use climpire_lib::runtime::oauth::OAuthService;
use climpire_lib::runtime::orchestrator::Orchestrator;
use climpire_lib::runtime::recovery;
use climpire_lib::runtime::usage_probe::UsageProbe;
use climpire_lib::vault::TokenVault;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| Config::log_filter_default().parse().expect("valid env filter")),
        )
        .init();

    let config = Arc::new(Config::load());
    std::fs::create_dir_all(&config.logs_dir).expect("failed to create logs directory");

    let db = Arc::new(Database::open(&config.db_path).expect("failed to open database"));
    let bus = Arc::new(EventBus::new());
    let vault = Arc::new(TokenVault::new(&config.vault_secret));
    let oauth = Arc::new(OAuthService::new(db.clone(), vault.clone(), config.clone()));
    let usage_probe = Arc::new(UsageProbe::new(db.clone(), bus.clone()));

    // §1/§5/§8 invariant 9: reconcile orphaned in_progress tasks before
    // anything else touches the store.
    recovery::recover(&db, &bus).await;

    let orchestrator = Orchestrator::new(db.clone(), bus.clone(), config.clone(), oauth.clone(), usage_probe.clone());
    let _break_rotation = orchestrator.spawn_break_rotation();

    {
        let usage_probe = usage_probe.clone();
        tokio::spawn(async move {
            loop {
                usage_probe.refresh_all().await;
                tokio::time::sleep(Duration::from_secs(300)).await;
            }
        });
    }

    let state = AppState {
        db: db.clone(),
        bus: bus.clone(),
        config: config.clone(),
        orchestrator: orchestrator.clone(),
        oauth,
        usage_probe,
        cli_status_cache: Arc::new(std::sync::Mutex::new(None)),
    };

    let router = api::build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.expect("failed to bind listener");
    tracing::info!(%addr, "climpire listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(orchestrator))
        .await
        .expect("server error");
}

/// Waits for SIGINT/SIGTERM, then runs the orchestrator's kill/rollback
/// sweep before letting `axum::serve` close the listener and active
/// connections (§5 Shutdown). A hung sweep is bounded so the process still
/// exits promptly.
async fn shutdown_signal(orchestrator: Arc<Orchestrator>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, rolling back in-flight tasks");
    match tokio::time::timeout(Duration::from_secs(5), orchestrator.shutdown()).await {
        Ok(()) => tracing::info!("shutdown sweep complete"),
        Err(_) => tracing::warn!("shutdown sweep did not finish within 5s, exiting anyway"),
    }
}
