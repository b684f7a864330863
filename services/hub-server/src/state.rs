//! The connection registry: the thread-safe map of device sockets,
//! controller sockets, last-known state, liveness counters, log
//! subscriptions, and binary routes described in spec §4.5.
//!
//! All seven maps live under one `tokio::sync::RwLock` so fan-out paths can
//! snapshot the sockets they need to write to and release the lock before
//! doing any I/O — the "snapshot-then-work" pattern from the Design Notes.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use hub_dispatch::{DeviceSink, DispatchError};
use hub_protocol::{kind, DeviceMessage, Envelope};
use hub_write::{AsyncWriteArbiter, SafeConn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

pub type ConnId = u64;

/// Abstracts over "a socket half we can write text frames to", so the
/// registry can be unit-tested without a real WebSocket upgrade.
#[async_trait]
pub trait ConnWriter: Send + Sync {
    async fn send_text(&self, text: String) -> Result<(), ConnWriteError>;
    async fn send_binary(&self, data: Vec<u8>) -> Result<(), ConnWriteError>;
    /// Sends a protocol-level ping, used by the liveness ticker to probe
    /// devices whose life counter hasn't been reset by an inbound frame.
    async fn ping(&self) -> Result<(), ConnWriteError>;
    /// Closes the socket, used when a device's life counter reaches zero.
    async fn close(&self) -> Result<(), ConnWriteError>;
}

#[derive(Debug, thiserror::Error)]
#[error("connection write failed")]
pub struct ConnWriteError;

pub type Conn = Arc<dyn ConnWriter>;

#[async_trait]
impl ConnWriter for SafeConn<SplitSink<WebSocket, Message>> {
    async fn send_text(&self, text: String) -> Result<(), ConnWriteError> {
        self.send(Message::Text(text.into())).await.map_err(|_| ConnWriteError)
    }

    async fn send_binary(&self, data: Vec<u8>) -> Result<(), ConnWriteError> {
        self.send(Message::Binary(data.into())).await.map_err(|_| ConnWriteError)
    }

    async fn ping(&self) -> Result<(), ConnWriteError> {
        self.send(Message::Ping(Vec::new().into())).await.map_err(|_| ConnWriteError)
    }

    async fn close(&self) -> Result<(), ConnWriteError> {
        self.send(Message::Close(None)).await.map_err(|_| ConnWriteError)
    }
}

/// Wraps a freshly split WebSocket sink half into a registry-ready `Conn`.
pub fn wrap_socket_sink(sink: SplitSink<WebSocket, Message>) -> Conn {
    Arc::new(SafeConn::new(sink))
}

struct DeviceHandle {
    conn_id: ConnId,
    conn: Conn,
}

#[derive(Clone)]
pub struct BinaryRoute {
    pub controller: ConnId,
    pub devices: Vec<String>,
}

#[derive(Default)]
struct RegistryInner {
    devices: HashMap<String, DeviceHandle>,
    reverse: HashMap<ConnId, String>,
    state: HashMap<String, serde_json::Value>,
    life: HashMap<String, i64>,
    controllers: HashMap<ConnId, Conn>,
    log_subs: HashMap<String, HashSet<ConnId>>,
    binary_routes: HashMap<String, BinaryRoute>,
}

/// Process-wide singleton. Cloning shares the registry and write arbiter.
#[derive(Clone)]
pub struct ConnRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    arbiter: Arc<AsyncWriteArbiter>,
    next_conn_id: Arc<AtomicU64>,
    /// Liveness ticks a device is allowed to go silent for before
    /// `tick_life_and_collect_dead` reports it as dead.
    missed_ping_limit: i64,
}

impl ConnRegistry {
    pub fn new(write_arbiter_capacity: usize, missed_ping_limit: i64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            arbiter: Arc::new(AsyncWriteArbiter::new(write_arbiter_capacity)),
            next_conn_id: Arc::new(AtomicU64::new(1)),
            missed_ping_limit,
        }
    }

    pub fn next_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Promotes a socket to controller. Checks under a read lock first
    /// (the common case: already a controller on every later control
    /// frame) before escalating to the write lock on first promotion.
    pub async fn promote_to_controller(&self, conn_id: ConnId, conn: Conn) {
        {
            let guard = self.inner.read().await;
            if guard.controllers.contains_key(&conn_id) {
                return;
            }
        }
        let mut guard = self.inner.write().await;
        guard.controllers.entry(conn_id).or_insert(conn);
    }

    pub async fn unregister_controller(&self, conn_id: ConnId) {
        let mut guard = self.inner.write().await;
        guard.controllers.remove(&conn_id);
        for subs in guard.log_subs.values_mut() {
            subs.remove(&conn_id);
        }
        guard.binary_routes.retain(|_, route| route.controller != conn_id);
    }

    /// Registers or refreshes a device entry. Returns `true` if this is the
    /// device's first registration (used to decide whether to also send
    /// `system/log/subscribe` for pre-existing subscribers).
    pub async fn register_device(&self, udid: &str, conn_id: ConnId, conn: Conn, state: serde_json::Value) -> bool {
        let mut guard = self.inner.write().await;
        let is_new = !guard.devices.contains_key(udid);
        guard.reverse.insert(conn_id, udid.to_owned());
        guard.devices.insert(udid.to_owned(), DeviceHandle { conn_id, conn });
        guard.state.insert(udid.to_owned(), state);
        guard.life.insert(udid.to_owned(), self.missed_ping_limit);
        is_new
    }

    /// Removes a device entry, but only if the currently-registered socket
    /// for `udid` is still `conn_id` — race-safe against a newer connection
    /// for the same UDID having already replaced it.
    pub async fn unregister_device(&self, udid: &str, conn_id: ConnId) {
        let mut guard = self.inner.write().await;
        guard.reverse.remove(&conn_id);
        if guard.devices.get(udid).map(|h| h.conn_id) == Some(conn_id) {
            guard.devices.remove(udid);
            guard.state.remove(udid);
            guard.life.remove(udid);
            guard.log_subs.remove(udid);
        }
    }

    pub async fn device_snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.inner.read().await.state.clone()
    }

    pub async fn update_device_state(&self, udid: &str, state: serde_json::Value) {
        self.inner.write().await.state.insert(udid.to_owned(), state);
    }

    pub async fn reset_life(&self, udid: &str) {
        if let Some(life) = self.inner.write().await.life.get_mut(udid) {
            *life = self.missed_ping_limit;
        }
    }

    #[cfg(test)]
    async fn set_life_for_test(&self, udid: &str, life: i64) {
        self.inner.write().await.life.insert(udid.to_owned(), life);
    }

    /// One ping-ticker tick: decrements every device's life counter by one
    /// and returns `(udid, conn)` pairs that just reached zero so the
    /// caller can close and clean up those sockets.
    pub async fn tick_life_and_collect_dead(&self) -> Vec<(String, Conn)> {
        let mut guard = self.inner.write().await;
        let dead_udids: Vec<String> = guard
            .life
            .iter_mut()
            .filter_map(|(udid, life)| {
                *life = life.saturating_sub(1);
                (*life <= 0).then(|| udid.clone())
            })
            .collect();

        let mut dead = Vec::new();
        for udid in dead_udids {
            guard.life.remove(&udid);
            if let Some(handle) = guard.devices.remove(&udid) {
                guard.reverse.remove(&handle.conn_id);
                guard.state.remove(&udid);
                guard.log_subs.remove(&udid);
                dead.push((udid, handle.conn));
            }
        }
        dead
    }

    pub async fn alive_device_conns(&self) -> Vec<Conn> {
        self.inner.read().await.devices.values().map(|h| h.conn.clone()).collect()
    }

    pub async fn controller_conns(&self) -> Vec<Conn> {
        self.inner.read().await.controllers.values().cloned().collect()
    }

    /// Adds `conn_id` to `udid`'s log-subscription set. Returns `true` if
    /// the set just became non-empty (caller should send
    /// `system/log/subscribe` to the device).
    pub async fn subscribe_log(&self, udid: &str, conn_id: ConnId) -> bool {
        let mut guard = self.inner.write().await;
        let subs = guard.log_subs.entry(udid.to_owned()).or_default();
        let was_empty = subs.is_empty();
        subs.insert(conn_id);
        was_empty && !subs.is_empty()
    }

    /// Removes `conn_id` from `udid`'s log-subscription set. Returns `true`
    /// if the set just became empty (caller should send
    /// `system/log/unsubscribe`).
    pub async fn unsubscribe_log(&self, udid: &str, conn_id: ConnId) -> bool {
        let mut guard = self.inner.write().await;
        let Some(subs) = guard.log_subs.get_mut(udid) else {
            return false;
        };
        subs.remove(&conn_id);
        subs.is_empty()
    }

    pub async fn log_subscriber_conns(&self, udid: &str) -> Vec<Conn> {
        let guard = self.inner.read().await;
        let Some(subs) = guard.log_subs.get(udid) else {
            return Vec::new();
        };
        subs.iter()
            .filter_map(|id| guard.controllers.get(id).cloned())
            .collect()
    }

    pub async fn install_binary_route(&self, request_id: String, controller: ConnId, devices: Vec<String>) {
        self.inner
            .write()
            .await
            .binary_routes
            .insert(request_id, BinaryRoute { controller, devices });
    }

    pub async fn binary_route(&self, request_id: &str) -> Option<BinaryRoute> {
        self.inner.read().await.binary_routes.get(request_id).cloned()
    }

    pub async fn remove_binary_route(&self, request_id: &str) {
        self.inner.write().await.binary_routes.remove(request_id);
    }

    pub async fn device_conn(&self, udid: &str) -> Option<Conn> {
        self.inner.read().await.devices.get(udid).map(|h| h.conn.clone())
    }

    pub async fn controller_conn(&self, conn_id: ConnId) -> Option<Conn> {
        self.inner.read().await.controllers.get(&conn_id).cloned()
    }

    pub fn arbiter(&self) -> Arc<AsyncWriteArbiter> {
        self.arbiter.clone()
    }

    /// Best-effort send to a device: logs and drops the error instead of
    /// propagating, for control-frame handlers that fan out to many devices
    /// and shouldn't let one offline device abort the batch.
    pub async fn send_to_device_logged(&self, udid: &str, envelope: Envelope) {
        let Some(conn) = self.device_conn(udid).await else {
            warn!(udid, "dropping frame for offline device");
            return;
        };
        if let Err(e) = send_envelope(&conn, &envelope).await {
            warn!(udid, error = %e, "write to device failed");
        }
    }

    /// Fans `envelope` out to every connected controller through the write
    /// arbiter.
    pub async fn broadcast_to_controllers(&self, envelope: Envelope) {
        for conn in self.controller_conns().await {
            let env = envelope.clone();
            let arbiter = self.arbiter.clone();
            arbiter
                .dispatch(async move {
                    if let Err(e) = send_envelope(&conn, &env).await {
                        warn!(error = %e, "fan-out write to controller failed");
                    }
                })
                .await;
        }
    }
}

pub async fn send_envelope(conn: &Conn, envelope: &Envelope) -> Result<(), ConnWriteError> {
    let text = serde_json::to_string(envelope).unwrap_or_default();
    conn.send_text(text).await
}

pub async fn send_binary(conn: &Conn, data: Vec<u8>) -> Result<(), ConnWriteError> {
    conn.send_binary(data).await
}

#[async_trait]
impl DeviceSink for ConnRegistry {
    async fn send_to_device(&self, udid: &str, envelope: Envelope) -> Result<(), DispatchError> {
        let Some(conn) = self.device_conn(udid).await else {
            return Err(DispatchError::DeviceOffline(udid.to_owned()));
        };
        send_envelope(&conn, &envelope)
            .await
            .map_err(|_| DispatchError::DeviceOffline(udid.to_owned()))
    }

    async fn broadcast_device_message(&self, msg: DeviceMessage) {
        let body = serde_json::to_value(msg).unwrap_or_default();
        self.broadcast_to_controllers(Envelope::new(kind::DEVICE_MESSAGE, body)).await;
    }
}

/// Everything a WebSocket and HTTP handler needs: the live connection
/// registry, the shared signer, the script dispatcher and its backing
/// caches/stores, and the startup config. One instance is built in `main`
/// and cloned into every handler via `axum::extract::State`.
#[derive(Clone)]
pub struct AppState {
    pub registry: ConnRegistry,
    pub auth: Arc<hub_auth::AuthSigner>,
    pub dispatcher: hub_dispatch::ScriptDispatcher,
    pub token_store: Arc<hub_transfer::TokenStore>,
    pub md5_cache: Arc<hub_md5cache::Md5Cache>,
    pub config: Arc<crate::config::Config>,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A `Conn` that records every text frame sent to it, for tests that
    /// only exercise registry bookkeeping rather than real socket I/O.
    struct RecordingConn {
        sent: tokio::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ConnWriter for RecordingConn {
        async fn send_text(&self, text: String) -> Result<(), ConnWriteError> {
            self.sent.lock().await.push(text);
            Ok(())
        }

        async fn send_binary(&self, data: Vec<u8>) -> Result<(), ConnWriteError> {
            self.sent.lock().await.push(format!("<binary:{}b>", data.len()));
            Ok(())
        }

        async fn ping(&self) -> Result<(), ConnWriteError> {
            self.sent.lock().await.push("<ping>".to_string());
            Ok(())
        }

        async fn close(&self) -> Result<(), ConnWriteError> {
            self.sent.lock().await.push("<close>".to_string());
            Ok(())
        }
    }

    fn noop_conn() -> Conn {
        Arc::new(RecordingConn { sent: tokio::sync::Mutex::new(Vec::new()) })
    }

    #[tokio::test]
    async fn register_device_reports_first_registration() {
        let registry = ConnRegistry::new(8, 3);
        let id = registry.next_conn_id();
        let is_new = registry
            .register_device("D1", id, noop_conn(), serde_json::json!({"battery": 90}))
            .await;
        assert!(is_new);

        let id2 = registry.next_conn_id();
        let is_new_again = registry
            .register_device("D1", id2, noop_conn(), serde_json::json!({"battery": 50}))
            .await;
        assert!(!is_new_again);
    }

    #[tokio::test]
    async fn unregister_is_race_safe_against_newer_connection() {
        let registry = ConnRegistry::new(8, 3);
        let old_id = registry.next_conn_id();
        registry.register_device("D1", old_id, noop_conn(), serde_json::json!({})).await;

        let new_id = registry.next_conn_id();
        registry.register_device("D1", new_id, noop_conn(), serde_json::json!({})).await;

        // The old connection's read loop terminates after the new one has
        // already replaced it; unregistering with the stale id must not
        // delete the newer entry.
        registry.unregister_device("D1", old_id).await;
        let snapshot = registry.device_snapshot().await;
        assert!(snapshot.contains_key("D1"));
    }

    #[tokio::test]
    async fn log_subscription_reports_transition_to_nonempty_and_back_to_empty() {
        let registry = ConnRegistry::new(8, 3);
        let conn_id = registry.next_conn_id();
        registry.promote_to_controller(conn_id, noop_conn()).await;

        assert!(registry.subscribe_log("D1", conn_id).await);
        assert!(!registry.subscribe_log("D1", conn_id).await);
        assert!(registry.unsubscribe_log("D1", conn_id).await);
    }

    #[tokio::test]
    async fn controller_disconnect_scrubs_subscriptions_and_binary_routes() {
        let registry = ConnRegistry::new(8, 3);
        let conn_id = registry.next_conn_id();
        registry.promote_to_controller(conn_id, noop_conn()).await;
        registry.subscribe_log("D1", conn_id).await;
        registry
            .install_binary_route("req-1".to_string(), conn_id, vec!["D1".to_string()])
            .await;

        registry.unregister_controller(conn_id).await;

        assert!(registry.log_subscriber_conns("D1").await.is_empty());
        assert!(registry.binary_route("req-1").await.is_none());
    }

    #[tokio::test]
    async fn tick_life_removes_devices_that_reach_zero() {
        let registry = ConnRegistry::new(8, 3);
        let id = registry.next_conn_id();
        registry.register_device("D1", id, noop_conn(), serde_json::json!({})).await;
        registry.set_life_for_test("D1", 1).await;

        let dead = registry.tick_life_and_collect_dead().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].0, "D1");
        assert!(registry.device_snapshot().await.is_empty());
    }

    /// Exercises the real `register_device` -> `tick_life_and_collect_dead`
    /// path end to end, with no `set_life_for_test` bypass: a freshly
    /// registered device must actually expire after `missed_ping_limit`
    /// silent ticks, not after `i64::MAX` of them.
    #[tokio::test]
    async fn freshly_registered_device_expires_after_missed_ping_limit_ticks() {
        let registry = ConnRegistry::new(8, 2);
        let id = registry.next_conn_id();
        registry.register_device("D1", id, noop_conn(), serde_json::json!({})).await;

        assert!(registry.tick_life_and_collect_dead().await.is_empty());
        let dead = registry.tick_life_and_collect_dead().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].0, "D1");
    }

    #[tokio::test]
    async fn reset_life_restores_the_full_missed_ping_budget() {
        let registry = ConnRegistry::new(8, 2);
        let id = registry.next_conn_id();
        registry.register_device("D1", id, noop_conn(), serde_json::json!({})).await;

        assert!(registry.tick_life_and_collect_dead().await.is_empty());
        registry.reset_life("D1").await;
        assert!(registry.tick_life_and_collect_dead().await.is_empty());
        let dead = registry.tick_life_and_collect_dead().await;
        assert_eq!(dead.len(), 1);
    }
}
