pub mod app_state;
pub mod auth;
pub mod authz;
pub mod config;
pub mod ctx;
pub mod error;
pub mod heartbeat;
pub mod http;
pub mod monitor;
pub mod persistence;
pub mod pool;
pub mod rpc;
pub mod runtime;
pub mod services;
pub mod testing;
pub mod upstream;
pub mod usage;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app_state::AppState;
use crate::auth::{Authenticator, StaticCredentialChecker};
use crate::monitor::Monitor;
use crate::pool::ConnCache;
use crate::runtime::Runtime;
use crate::upstream::RestDialer;
use crate::usage::HttpUsageAuthorizationClient;

pub use crate::error::Result;

/// Boot the gateway and serve until interrupted.
pub async fn run() -> anyhow::Result<()> {
    run_with_shutdown(shutdown_signal()).await
}

pub async fn run_with_shutdown<S>(shutdown: S) -> anyhow::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let app_config = config::load()?;
    let metrics_handle = http::init_metrics_recorder();

    let db = persistence::migrations::init_pool(&app_config.database.url).await?;
    persistence::migrations::run_migrations(&db).await?;
    let controller_uuid = persistence::migrations::ensure_controller_uuid(&db).await?;

    let runtime = Runtime::new();
    let conn_cache = Arc::new(ConnCache::new(
        Duration::from_secs(app_config.pool.ttl_secs),
        app_config.pool.capacity,
        runtime.clock(),
    ));
    let dialer = Arc::new(RestDialer {
        timeout: Duration::from_secs(app_config.dial.timeout_secs),
        retry_delay: Duration::from_millis(app_config.dial.retry_ms),
    });
    let checker = StaticCredentialChecker::new(app_config.auth.user_tokens()?);
    let authenticator =
        Authenticator::new(app_config.auth.controller_admin.clone(), Arc::new(checker))?;
    let usage_client = if app_config.usage.sender_url.is_empty() {
        None
    } else {
        Some(Arc::new(HttpUsageAuthorizationClient::new(
            &app_config.usage.sender_url,
        )?) as Arc<dyn usage::UsageSenderAuthorizationClient>)
    };

    let state = AppState {
        db,
        conn_cache,
        dialer,
        runtime,
        authenticator,
        usage_client,
        controller_uuid,
        server_version: env!("CARGO_PKG_VERSION").to_string(),
        monitor: app_config.monitor.clone(),
        heartbeat_idle_timeout: Duration::from_secs(app_config.heartbeat.idle_timeout_secs),
    };

    let owner_id = format!(
        "{}-{}",
        std::env::var("HOSTNAME").unwrap_or_else(|_| "gatehouse".to_string()),
        &state.controller_uuid[..8.min(state.controller_uuid.len())]
    );
    let monitor = Monitor::start(state.clone(), owner_id);

    let api_addr: SocketAddr = format!("{}:{}", app_config.server.host, app_config.server.port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid listen address: {}", err))?;
    let metrics_addr: SocketAddr =
        format!("{}:{}", app_config.metrics.host, app_config.metrics.port)
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid metrics listen address: {}", err))?;

    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    info!(%api_addr, "gateway listening");
    info!(%metrics_addr, "gateway metrics listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown.await;
        let _ = shutdown_tx.send(true);
    });

    let rpc_state = state.clone();
    let mut rpc_shutdown = shutdown_rx.clone();
    let mut rpc_task = tokio::spawn(async move {
        tokio::select! {
            _ = rpc::serve(rpc_state, api_listener) => {}
            _ = rpc_shutdown.changed() => {}
        }
    });

    let metrics_app = http::build_metrics_router(metrics_handle);
    let mut metrics_shutdown = shutdown_rx.clone();
    let mut metrics_task = tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_app)
            .with_graceful_shutdown(async move {
                let _ = metrics_shutdown.changed().await;
            })
            .await
    });

    tokio::select! {
        res = &mut rpc_task => {
            res.map_err(|err| anyhow::anyhow!("gateway RPC task failed: {err}"))?;
        }
        res = &mut metrics_task => {
            res.map_err(|err| anyhow::anyhow!("gateway metrics task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("gateway metrics server failed: {err}"))?;
        }
    }

    monitor.shutdown().await;
    Ok(())
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }
}
