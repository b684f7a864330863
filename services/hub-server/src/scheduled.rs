//! Background tickers: device liveness, periodic state refresh, and
//! transfer-token garbage collection. One `CancellationToken` stops all
//! three together during graceful shutdown.

use crate::config::Config;
use crate::state::ConnRegistry;
use hub_protocol::{kind, Envelope};
use hub_transfer::TokenStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub fn spawn_scheduled_tasks(
    registry: ConnRegistry,
    token_store: Arc<TokenStore>,
    config: Arc<Config>,
    shutdown: CancellationToken,
) {
    spawn_ping_ticker(registry.clone(), config.clone(), shutdown.clone());
    spawn_state_ticker(registry, config.clone(), shutdown.clone());
    spawn_token_gc_ticker(token_store, config, shutdown);
}

fn spawn_ping_ticker(registry: ConnRegistry, config: Arc<Config>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.ping_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            let dead = registry.tick_life_and_collect_dead().await;
            for (udid, conn) in dead {
                if let Err(e) = conn.close().await {
                    warn!(udid, error = %e, "failed to close socket for expired device");
                }
                info!(udid, "device liveness expired");
            }

            for conn in registry.alive_device_conns().await {
                if let Err(e) = conn.ping().await {
                    warn!(error = %e, "ping write failed");
                }
            }
        }
    });
}

fn spawn_state_ticker(registry: ConnRegistry, config: Arc<Config>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.state_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            let refresh = Envelope::new(kind::APP_STATE, serde_json::Value::Null);
            for conn in registry.alive_device_conns().await {
                let arbiter = registry.arbiter();
                let refresh = refresh.clone();
                arbiter
                    .dispatch(async move {
                        let _ = crate::state::send_envelope(&conn, &refresh).await;
                    })
                    .await;
            }
        }
    });
}

fn spawn_token_gc_ticker(token_store: Arc<TokenStore>, config: Arc<Config>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.token_gc_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => break,
            }
            token_store.gc(config.shared_source_grace).await;
        }
    });
}
