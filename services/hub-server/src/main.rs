use hub_auth::AuthSigner;
use hub_dispatch::ScriptDispatcher;
use hub_md5cache::Md5Cache;
use hub_server::config::Config;
use hub_server::state::{AppState, ConnRegistry};
use hub_transfer::TokenStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = Arc::new(Config::from_env());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .init();

    let shutdown = CancellationToken::new();

    let registry = ConnRegistry::new(config.write_arbiter_capacity, config.missed_ping_limit);
    let auth = Arc::new(AuthSigner::new(config.passhash.clone()));
    let md5_cache = Arc::new(Md5Cache::new());
    let token_store = Arc::new(TokenStore::new());
    let dispatcher = ScriptDispatcher::new(
        config.script_root.clone(),
        md5_cache.clone(),
        token_store.clone(),
        config.script_start_delay,
        config.script_start_timeout,
        shutdown.clone(),
    );

    hub_server::scheduled::spawn_scheduled_tasks(
        registry.clone(),
        token_store.clone(),
        config.clone(),
        shutdown.clone(),
    );

    let state = AppState {
        registry,
        auth,
        dispatcher,
        token_store,
        md5_cache,
        config: config.clone(),
    };
    let router = hub_server::build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %config.bind_addr, "server listening");

    let shutdown_for_signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_for_signal.cancel();
    });

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .expect("server error");
    info!("server shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
