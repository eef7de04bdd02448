use std::sync::Arc;

use anyhow::Context;
use axum::{Json, Router, extract::State, routing::get};
use hearth_control::{
    config::EngineConfig, games::GameCatalog, ports::PoolStats, scheduler::JobScheduler,
    state::EngineContext, store::Store, store_db::DbStore,
};
use sea_orm_migration::MigratorTrait;
use serde::Serialize;

#[derive(Clone)]
struct HttpState {
    ctx: EngineContext,
    scheduler: JobScheduler,
}

#[derive(Debug, Serialize)]
struct HealthzPool {
    name: String,
    #[serde(flatten)]
    stats: Option<PoolStats>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    active_jobs: usize,
    games: usize,
    pools: Vec<HealthzPool>,
}

async fn healthz(State(state): State<HttpState>) -> Json<HealthzResponse> {
    let names: Vec<String> = state.ctx.ports.pools().map(|(n, _)| n.to_string()).collect();
    let mut pools = Vec::with_capacity(names.len());
    for name in names {
        let pool = match state.ctx.ports.stats(&name).await {
            Ok(stats) => HealthzPool {
                name,
                stats: Some(stats),
                error: None,
            },
            Err(e) => HealthzPool {
                name,
                stats: None,
                error: Some(e.to_string()),
            },
        };
        pools.push(pool);
    }

    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        active_jobs: state.scheduler.active_jobs(),
        games: state.ctx.games.ids().await.len(),
        pools,
    })
}

async fn connect_store(cfg: &EngineConfig) -> anyhow::Result<Arc<dyn Store>> {
    let database_url = cfg
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required"))?;
    let db = hearth_db::connect(database_url)
        .await
        .context("connect to database")?;

    // Apply migrations on boot (idempotent).
    hearth_migration::Migrator::up(&db, None)
        .await
        .context("apply migrations")?;

    let store: Arc<dyn Store> = Arc::new(DbStore::new(Arc::new(db)));
    Ok(store)
}

#[cfg(unix)]
fn spawn_catalog_reload(games: GameCatalog) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangups = signal(SignalKind::hangup()).context("install SIGHUP handler")?;
    tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            match games.reload().await {
                Ok(count) => tracing::info!(count, "game catalog reloaded"),
                Err(e) => tracing::warn!(error = %format!("{e:#}"), "game catalog reload failed, keeping the previous one"),
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_catalog_reload(_games: GameCatalog) -> anyhow::Result<()> {
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = EngineConfig::from_env()?;
    let store = connect_store(&cfg).await?;
    let games = GameCatalog::load(cfg.games_dir.clone())
        .await
        .with_context(|| format!("load game definitions from {}", cfg.games_dir.display()))?;
    let ctx = EngineContext::from_config(&cfg, store, games.clone())?;

    let scheduler = JobScheduler::new(ctx.clone(), cfg.scheduler.clone());
    let loops = scheduler.spawn();
    spawn_catalog_reload(games)?;

    let app = Router::new()
        .route("/healthz", get(healthz))
        .with_state(HttpState {
            ctx,
            scheduler: scheduler.clone(),
        });
    let listener = tokio::net::TcpListener::bind(cfg.http_addr)
        .await
        .with_context(|| format!("bind {}", cfg.http_addr))?;
    tracing::info!(addr = %cfg.http_addr, "hearth-control HTTP listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down, waiting for running jobs");
    let drained = scheduler.shutdown(cfg.scheduler.shutdown_grace).await;
    for handle in loops {
        let _ = handle.await;
    }
    if !drained {
        tracing::warn!(
            active = scheduler.active_jobs(),
            "exiting with jobs still running"
        );
    }
    Ok(())
}
