//! Script dispatch orchestration: packages a script bundle, sends small
//! files in-band and large files via transfer tokens, and defers
//! `script/run` until every large-file fetch for the device completes.

mod pkg;

pub use pkg::{apply_config_overlay, FileData, PackagingError, PkgCacheKey, ScriptPackage, ScriptPkgCache};

use async_trait::async_trait;
use hub_md5cache::{FileStat, Md5Cache};
use hub_protocol::{kind, DeviceMessage, Envelope, ScriptRun, TokenDirection, TransferFetch};
use hub_transfer::{TokenStore, TransferRecord};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_START_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(360);

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("packaging failed: {0}")]
    Packaging(#[from] PackagingError),
    #[error("device offline: {0}")]
    DeviceOffline(String),
}

/// The seam `ScriptDispatcher` writes through — implemented by the
/// connection registry so this crate never depends on `hub-server`.
#[async_trait]
pub trait DeviceSink: Send + Sync {
    async fn send_to_device(&self, udid: &str, envelope: Envelope) -> Result<(), DispatchError>;
    async fn broadcast_device_message(&self, msg: DeviceMessage);
}

struct PendingScriptStart {
    script_name: String,
    pending_request_ids: HashSet<String>,
    /// request_id -> target_path, for the legacy fallback match.
    request_targets: HashMap<String, String>,
    generation: u64,
}

/// Process-wide singleton orchestrating script sends. Cloning shares state.
#[derive(Clone)]
pub struct ScriptDispatcher {
    script_root: PathBuf,
    pkg_cache: Arc<ScriptPkgCache>,
    md5_cache: Arc<Md5Cache>,
    token_store: Arc<TokenStore>,
    pending: Arc<Mutex<HashMap<String, PendingScriptStart>>>,
    start_locks: Arc<Mutex<HashSet<String>>>,
    start_delay: Duration,
    start_timeout: Duration,
    shutdown: CancellationToken,
}

impl ScriptDispatcher {
    pub fn new(
        script_root: PathBuf,
        md5_cache: Arc<Md5Cache>,
        token_store: Arc<TokenStore>,
        start_delay: Duration,
        start_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            script_root,
            pkg_cache: Arc::new(ScriptPkgCache::new()),
            md5_cache,
            token_store,
            pending: Arc::new(Mutex::new(HashMap::new())),
            start_locks: Arc::new(Mutex::new(HashSet::new())),
            start_delay,
            start_timeout,
            shutdown,
        }
    }

    /// Dispatches `script_name` to every device in `devices`. Devices with
    /// an in-flight start are skipped (a cancel message is broadcast for
    /// them) rather than failing the whole batch.
    pub async fn dispatch<S: DeviceSink + Clone + 'static>(
        &self,
        sink: &S,
        devices: Vec<String>,
        script_name: &str,
        config_overlay: Option<serde_json::Value>,
        server_base_url: &str,
    ) -> Result<(), DispatchError> {
        let package = self.pkg_cache.get_or_package(&self.script_root, script_name).await?;

        // The merged main.json body depends only on the package and the
        // overlay, not on the device — compute it once per dispatch call
        // and share the encoded bytes across every device instead of
        // re-decoding/re-merging/re-encoding it once per device.
        let main_config_body = package
            .files
            .iter()
            .find(|f| f.is_main_config)
            .and_then(|f| f.inline_data.as_ref())
            .map(|inline| merged_main_json_body(inline, config_overlay.as_ref()));

        for device in devices {
            if !self.try_acquire_start_lock(&device).await {
                sink.broadcast_device_message(DeviceMessage {
                    udid: Some(device.clone()),
                    message: format!("脚本启动已取消: start already in flight ({script_name})"),
                })
                .await;
                continue;
            }

            if let Err(e) = self
                .dispatch_one(sink, &device, script_name, &package, main_config_body.clone(), server_base_url)
                .await
            {
                self.release_start_lock(&device).await;
                warn!(device = %device, error = %e, "script dispatch failed for device");
            }
        }
        Ok(())
    }

    async fn dispatch_one<S: DeviceSink + Clone + 'static>(
        &self,
        sink: &S,
        device: &str,
        script_name: &str,
        package: &ScriptPackage,
        main_config_body: Option<serde_json::Value>,
        server_base_url: &str,
    ) -> Result<(), DispatchError> {
        let mut large_files = Vec::new();

        // Small files first, in package order, so they land before any
        // fetch instruction per-socket ordering guarantees.
        for file in &package.files {
            if let Some(inline) = &file.inline_data {
                let body = if file.is_main_config {
                    main_config_body.clone().unwrap_or_else(|| {
                        serde_json::json!({ "targetPath": file.target_path, "data": inline })
                    })
                } else {
                    serde_json::json!({
                        "targetPath": file.target_path,
                        "data": inline,
                    })
                };
                sink.send_to_device(device, Envelope::new(kind::FILE_PUT, body)).await?;
            } else {
                large_files.push(file.clone());
            }
        }

        if large_files.is_empty() {
            self.schedule_immediate_start(sink.clone(), device.to_string(), script_name.to_string());
            return Ok(());
        }

        // Register the pending-start record (and its timeout) before a single
        // fetch instruction goes out, so a device that answers instantly can
        // never race `on_fetch_complete` ahead of the record it needs to match.
        let generation = {
            let mut guard = self.pending.lock().await;
            let generation = guard.get(device).map(|p| p.generation + 1).unwrap_or(0);
            guard.insert(
                device.to_string(),
                PendingScriptStart {
                    script_name: script_name.to_string(),
                    pending_request_ids: HashSet::new(),
                    request_targets: HashMap::new(),
                    generation,
                },
            );
            generation
        };
        self.schedule_timeout(sink.clone(), device.to_string(), generation);

        for file in &large_files {
            let request_id = format!("{device}-{}-{}", script_name, file.normalized_path);
            let stat = FileStat::from_metadata(&std::fs::metadata(&file.source_path).map_err(|e| {
                DispatchError::Packaging(PackagingError::Io {
                    path: file.source_path.clone(),
                    source: e,
                })
            })?)
            .map_err(|e| DispatchError::Packaging(PackagingError::Io {
                path: file.source_path.clone(),
                source: e,
            }))?;
            let md5 = self
                .md5_cache
                .digest(&file.source_path, Some(stat))
                .await
                .map(Some)
                .unwrap_or(None);

            let token = TokenStore::generate_token();
            self.token_store
                .create(
                    TransferRecord {
                        token: token.clone(),
                        direction: TokenDirection::Download,
                        server_path: file.source_path.clone(),
                        device_path: file.target_path.clone(),
                        device_udid: device.to_string(),
                        expires_at: Instant::now() + self.start_timeout + Duration::from_secs(60),
                        one_time: true,
                        total_bytes: file.size,
                        md5: md5.clone(),
                        shared_source_id: None,
                        category: None,
                    },
                    None,
                )
                .await;

            {
                let mut guard = self.pending.lock().await;
                if let Some(pending) = guard.get_mut(device) {
                    if pending.generation == generation {
                        pending.pending_request_ids.insert(request_id.clone());
                        pending.request_targets.insert(request_id.clone(), file.target_path.clone());
                    }
                }
            }

            let fetch = TransferFetch {
                request_id: request_id.clone(),
                url: format!("{server_base_url}/transfer/download/{token}"),
                target_path: file.target_path.clone(),
                md5: md5.unwrap_or_default(),
                total_bytes: file.size,
            };
            sink.send_to_device(
                device,
                Envelope::new(kind::TRANSFER_FETCH, serde_json::to_value(fetch).unwrap_or_default()),
            )
            .await?;
        }

        Ok(())
    }

    fn schedule_immediate_start<S: DeviceSink + Clone + 'static>(
        &self,
        sink: S,
        device: String,
        script_name: String,
    ) {
        let delay = self.start_delay;
        let dispatcher = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sink
                .send_to_device(&device, Envelope::new(kind::SCRIPT_RUN, serde_json::to_value(ScriptRun { name: script_name }).unwrap_or_default()))
                .await;
            sink.broadcast_device_message(DeviceMessage {
                udid: Some(device.clone()),
                message: "script started".to_string(),
            })
            .await;
            dispatcher.release_start_lock(&device).await;
        });
    }

    fn schedule_timeout<S: DeviceSink + Clone + 'static>(&self, sink: S, device: String, generation: u64) {
        let dispatcher = self.clone();
        let timeout = self.start_timeout;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = shutdown.cancelled() => return,
            }
            let mut guard = dispatcher.pending.lock().await;
            let still_pending = guard
                .get(&device)
                .map(|p| p.generation == generation)
                .unwrap_or(false);
            if !still_pending {
                return;
            }
            guard.remove(&device);
            drop(guard);
            dispatcher.release_start_lock(&device).await;
            sink.broadcast_device_message(DeviceMessage {
                udid: Some(device.clone()),
                message: "script start timed out".to_string(),
            })
            .await;
        });
    }

    /// Handles a `transfer/fetch/complete` frame from `device`.
    pub async fn on_fetch_complete<S: DeviceSink + Clone + 'static>(
        &self,
        sink: &S,
        device: &str,
        request_id: Option<&str>,
        target_path: Option<&str>,
        success: bool,
        error: Option<&str>,
    ) {
        let mut guard = self.pending.lock().await;
        let Some(pending) = guard.get_mut(device) else {
            return;
        };

        let matched_id = match request_id {
            Some(id) if pending.pending_request_ids.contains(id) => Some(id.to_string()),
            _ => target_path.and_then(|tp| {
                pending
                    .request_targets
                    .iter()
                    .find(|(_, v)| v.as_str() == tp)
                    .map(|(k, _)| k.clone())
            }),
        };
        let Some(id) = matched_id else {
            return;
        };

        if !success {
            let script_name = pending.script_name.clone();
            let tp = pending
                .request_targets
                .get(&id)
                .cloned()
                .unwrap_or_else(|| id.clone());
            guard.remove(device);
            drop(guard);
            self.release_start_lock(device).await;
            let reason = error.unwrap_or("unknown error");
            info!(device, script_name, "script start cancelled: {reason} ({tp})");
            sink.broadcast_device_message(DeviceMessage {
                udid: Some(device.to_string()),
                message: format!("脚本启动已取消: {reason} ({tp})"),
            })
            .await;
            return;
        }

        pending.pending_request_ids.remove(&id);
        if !pending.pending_request_ids.is_empty() {
            return;
        }
        let script_name = pending.script_name.clone();
        guard.remove(device);
        drop(guard);

        let _ = sink
            .send_to_device(device, Envelope::new(kind::SCRIPT_RUN, serde_json::to_value(ScriptRun { name: script_name }).unwrap_or_default()))
            .await;
        sink.broadcast_device_message(DeviceMessage {
            udid: Some(device.to_string()),
            message: "script started".to_string(),
        })
        .await;
        self.release_start_lock(device).await;
    }

    async fn try_acquire_start_lock(&self, device: &str) -> bool {
        self.start_locks.lock().await.insert(device.to_string())
    }

    async fn release_start_lock(&self, device: &str) {
        self.start_locks.lock().await.remove(device);
    }
}

fn merged_main_json_body(inline_base64: &str, overlay: Option<&serde_json::Value>) -> serde_json::Value {
    use base64::Engine;
    let Some(overlay) = overlay else {
        return serde_json::json!({ "targetPath": "main.json", "data": inline_base64 });
    };
    let Ok(raw) = base64::engine::general_purpose::STANDARD.decode(inline_base64) else {
        return serde_json::json!({ "targetPath": "main.json", "data": inline_base64 });
    };
    let Ok(mut parsed) = serde_json::from_slice::<serde_json::Value>(&raw) else {
        return serde_json::json!({ "targetPath": "main.json", "data": inline_base64 });
    };
    apply_config_overlay(&mut parsed, overlay);
    let re_encoded = base64::engine::general_purpose::STANDARD.encode(serde_json::to_vec(&parsed).unwrap_or_default());
    serde_json::json!({ "targetPath": "main.json", "data": re_encoded })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    #[derive(Clone)]
    struct RecordingSink {
        sent: Arc<StdMutex<Vec<(String, Envelope)>>>,
        broadcasts: UnboundedSenderHandle,
    }

    #[derive(Clone)]
    struct UnboundedSenderHandle(Arc<UnboundedSender<DeviceMessage>>);

    impl RecordingSink {
        fn new() -> (Self, UnboundedReceiver<DeviceMessage>) {
            let (tx, rx) = unbounded_channel();
            (
                Self {
                    sent: Arc::new(StdMutex::new(Vec::new())),
                    broadcasts: UnboundedSenderHandle(Arc::new(tx)),
                },
                rx,
            )
        }
    }

    #[async_trait]
    impl DeviceSink for RecordingSink {
        async fn send_to_device(&self, udid: &str, envelope: Envelope) -> Result<(), DispatchError> {
            self.sent.lock().unwrap().push((udid.to_string(), envelope));
            Ok(())
        }

        async fn broadcast_device_message(&self, msg: DeviceMessage) {
            let _ = self.broadcasts.0.send(msg);
        }
    }

    fn dispatcher(root: PathBuf) -> ScriptDispatcher {
        ScriptDispatcher::new(
            root,
            Arc::new(Md5Cache::new()),
            Arc::new(TokenStore::new()),
            Duration::from_millis(10),
            Duration::from_millis(200),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn all_small_files_emits_script_run_after_delay() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.lua"), b"ok").unwrap();
        let d = dispatcher(dir.path().to_path_buf());
        let (sink, mut rx) = RecordingSink::new();

        d.dispatch(&sink, vec!["D1".to_string()], "main.lua", None, "http://hub")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let sent = sink.sent.lock().unwrap();
        assert!(sent.iter().any(|(udid, env)| udid == "D1" && env.msg_type == kind::SCRIPT_RUN));
        drop(sent);
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.message, "script started");
    }

    #[tokio::test]
    async fn large_file_dispatch_waits_for_fetch_complete() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("bundle");
        std::fs::create_dir_all(bundle.join("assets")).unwrap();
        let big = vec![0u8; (pkg::SMALL_FILE_THRESHOLD + 10) as usize];
        std::fs::write(bundle.join("assets/blob.bin"), &big).unwrap();

        let d = dispatcher(dir.path().to_path_buf());
        let (sink, mut rx) = RecordingSink::new();

        d.dispatch(&sink, vec!["D1".to_string()], "bundle", None, "http://hub")
            .await
            .unwrap();

        let sent = sink.sent.lock().unwrap();
        let fetch = sent.iter().find(|(_, e)| e.msg_type == kind::TRANSFER_FETCH).cloned();
        drop(sent);
        let (_, fetch_env) = fetch.expect("expected a transfer/fetch frame");
        let fetch_body: TransferFetch = fetch_env.decode_body().unwrap();

        d.on_fetch_complete(&sink, "D1", Some(&fetch_body.request_id), None, true, None)
            .await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.message, "script started");
    }

    #[tokio::test]
    async fn failed_fetch_broadcasts_chinese_cancel_message() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("bundle");
        std::fs::create_dir_all(bundle.join("assets")).unwrap();
        let big = vec![0u8; (pkg::SMALL_FILE_THRESHOLD + 10) as usize];
        std::fs::write(bundle.join("assets/blob.bin"), &big).unwrap();

        let d = dispatcher(dir.path().to_path_buf());
        let (sink, mut rx) = RecordingSink::new();

        d.dispatch(&sink, vec!["D1".to_string()], "bundle", None, "http://hub")
            .await
            .unwrap();

        let sent = sink.sent.lock().unwrap();
        let (_, fetch_env) = sent
            .iter()
            .find(|(_, e)| e.msg_type == kind::TRANSFER_FETCH)
            .cloned()
            .unwrap();
        drop(sent);
        let fetch_body: TransferFetch = fetch_env.decode_body().unwrap();

        d.on_fetch_complete(&sink, "D1", Some(&fetch_body.request_id), None, false, Some("md5 mismatch"))
            .await;

        let msg = rx.recv().await.unwrap();
        assert!(msg.message.contains("脚本启动已取消"));
        assert!(msg.message.contains("md5 mismatch"));
    }

    #[tokio::test]
    async fn main_config_overlay_is_merged_once_and_shared_across_devices() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("bundle");
        std::fs::create_dir_all(&bundle).unwrap();
        std::fs::write(bundle.join("main.json"), br#"{"interval": 5}"#).unwrap();

        let d = dispatcher(dir.path().to_path_buf());
        let (sink, _rx) = RecordingSink::new();

        d.dispatch(
            &sink,
            vec!["D1".to_string(), "D2".to_string()],
            "bundle",
            Some(serde_json::json!({"interval": 9})),
            "http://hub",
        )
        .await
        .unwrap();

        let sent = sink.sent.lock().unwrap();
        let bodies: Vec<_> = sent
            .iter()
            .filter(|(_, e)| e.msg_type == kind::FILE_PUT)
            .map(|(_, e)| e.body.clone())
            .collect();
        assert_eq!(bodies.len(), 2);
        // Both devices receive the exact same merged-and-re-encoded body —
        // proof the merge ran once per `dispatch()` call, not once per device.
        assert_eq!(bodies[0], bodies[1]);
    }

    #[tokio::test]
    async fn pending_start_is_registered_before_any_fetch_is_sent() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("bundle");
        std::fs::create_dir_all(bundle.join("assets")).unwrap();
        let big = vec![0u8; (pkg::SMALL_FILE_THRESHOLD + 10) as usize];
        std::fs::write(bundle.join("assets/blob.bin"), &big).unwrap();

        let d = dispatcher(dir.path().to_path_buf());
        let (sink, mut rx) = RecordingSink::new();

        d.dispatch(&sink, vec!["D1".to_string()], "bundle", None, "http://hub")
            .await
            .unwrap();

        let sent = sink.sent.lock().unwrap();
        let (_, fetch_env) = sent
            .iter()
            .find(|(_, e)| e.msg_type == kind::TRANSFER_FETCH)
            .cloned()
            .unwrap();
        drop(sent);
        let fetch_body: TransferFetch = fetch_env.decode_body().unwrap();

        // Simulates the fastest possible device: `fetch/complete` answered
        // the instant the fetch instruction was observed, racing ahead of
        // anything dispatch_one does after sending it. Must still match.
        d.on_fetch_complete(&sink, "D1", Some(&fetch_body.request_id), None, true, None)
            .await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.message, "script started");
    }

    #[tokio::test]
    async fn second_dispatch_while_in_flight_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("bundle");
        std::fs::create_dir_all(bundle.join("assets")).unwrap();
        let big = vec![0u8; (pkg::SMALL_FILE_THRESHOLD + 10) as usize];
        std::fs::write(bundle.join("assets/blob.bin"), &big).unwrap();

        let d = dispatcher(dir.path().to_path_buf());
        let (sink, mut rx) = RecordingSink::new();

        d.dispatch(&sink, vec!["D1".to_string()], "bundle", None, "http://hub")
            .await
            .unwrap();
        d.dispatch(&sink, vec!["D1".to_string()], "bundle", None, "http://hub")
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert!(msg.message.contains("已取消"));
    }
}
