//! Transfer token lifecycle: create/consume/gc, plus refcounted shared
//! temp-file cleanup for multi-device script dispatches.

use base64::Engine;
use hub_protocol::TokenDirection;
use rand::RngCore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

/// Grace period before a drained shared-source temp file is actually
/// deleted, giving late-arriving tokens a chance to re-attach.
pub const DEFAULT_SHARED_SOURCE_GRACE: Duration = Duration::from_secs(30);

const DELETE_RETRY_ATTEMPTS: u32 = 3;
const DELETE_RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub token: String,
    pub direction: TokenDirection,
    pub server_path: PathBuf,
    /// Device-side target path (download) or the path the device claims to
    /// be saving from (upload, informational only).
    pub device_path: String,
    pub device_udid: String,
    pub expires_at: Instant,
    pub one_time: bool,
    pub total_bytes: u64,
    pub md5: Option<String>,
    pub shared_source_id: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeError {
    NotFound,
    Expired,
    WrongDirection,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("token not found")]
    NotFound,
    #[error("token expired")]
    Expired,
    #[error("token direction mismatch")]
    DirectionMismatch,
}

impl From<ConsumeError> for TransferError {
    fn from(e: ConsumeError) -> Self {
        match e {
            ConsumeError::NotFound => TransferError::NotFound,
            ConsumeError::Expired => TransferError::Expired,
            ConsumeError::WrongDirection => TransferError::DirectionMismatch,
        }
    }
}

#[derive(Debug)]
struct SharedSourceRef {
    path: PathBuf,
    refcount: u64,
    pending_cleanup: bool,
    generation: u64,
}

#[derive(Debug, Default)]
struct Inner {
    tokens: HashMap<String, TransferRecord>,
    shared: HashMap<String, SharedSourceRef>,
}

/// Process-wide singleton tracking every live transfer token and the
/// refcounted temp files shared across a single script dispatch batch.
#[derive(Debug, Clone, Default)]
pub struct TokenStore {
    inner: Arc<Mutex<Inner>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates an opaque URL-safe token, unrelated to the signing scheme —
    /// the token itself is the capability for `/transfer/*` requests.
    pub fn generate_token() -> String {
        let mut bytes = [0u8; 24];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    }

    /// `create(record, optional shared-id)`: inserts the record; if a
    /// shared-source-id is given, increments its refcount (creating it on
    /// first use, binding the current file path).
    pub async fn create(&self, record: TransferRecord, shared_path_if_new: Option<PathBuf>) {
        let mut guard = self.inner.lock().await;
        if let Some(id) = record.shared_source_id.clone() {
            let entry = guard.shared.entry(id).or_insert_with(|| SharedSourceRef {
                path: shared_path_if_new.unwrap_or_else(|| record.server_path.clone()),
                refcount: 0,
                pending_cleanup: false,
                generation: 0,
            });
            entry.refcount += 1;
            entry.pending_cleanup = false;
        }
        guard.tokens.insert(record.token.clone(), record);
    }

    /// `consume(token, expected-direction)`.
    pub async fn consume(
        &self,
        token: &str,
        expected_direction: TokenDirection,
        grace: Duration,
    ) -> Result<TransferRecord, ConsumeError> {
        let mut guard = self.inner.lock().await;
        let record = guard.tokens.get(token).ok_or(ConsumeError::NotFound)?;

        if Instant::now() >= record.expires_at {
            guard.tokens.remove(token);
            return Err(ConsumeError::Expired);
        }
        if record.direction != expected_direction {
            return Err(ConsumeError::WrongDirection);
        }

        let record = if record.one_time {
            guard.tokens.remove(token).expect("checked present above")
        } else {
            record.clone()
        };

        if record.one_time {
            if let Some(id) = record.shared_source_id.clone() {
                self.release_shared_locked(&mut guard, &id, grace);
            }
        }

        Ok(record)
    }

    /// `releaseShared(id)`: decrements refcount; at zero, schedules a
    /// delayed delete that aborts if the generation changed or the
    /// refcount became nonzero again by the time it fires.
    pub async fn release_shared(&self, id: &str, grace: Duration) {
        let mut guard = self.inner.lock().await;
        self.release_shared_locked(&mut guard, id, grace);
    }

    fn release_shared_locked(&self, guard: &mut Inner, id: &str, grace: Duration) {
        let Some(entry) = guard.shared.get_mut(id) else {
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount > 0 {
            return;
        }
        entry.pending_cleanup = true;
        entry.generation += 1;
        let generation = entry.generation;
        let path = entry.path.clone();
        let id = id.to_string();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut guard = inner.lock().await;
            let Some(entry) = guard.shared.get(&id) else {
                return;
            };
            if entry.generation != generation || entry.refcount != 0 {
                return;
            }
            guard.shared.remove(&id);
            drop(guard);
            delete_with_retries(&path).await;
        });
    }

    /// Periodic sweep: deletes expired token entries and releases their
    /// shared-source refs. Driven externally by a scheduled task.
    pub async fn gc(&self, grace: Duration) {
        let now = Instant::now();
        let mut expired_shared_ids = Vec::new();
        {
            let mut guard = self.inner.lock().await;
            let expired: Vec<String> = guard
                .tokens
                .iter()
                .filter(|(_, r)| now >= r.expires_at)
                .map(|(k, _)| k.clone())
                .collect();
            for token in expired {
                if let Some(record) = guard.tokens.remove(&token) {
                    if let Some(id) = record.shared_source_id {
                        expired_shared_ids.push(id);
                    }
                }
            }
        }
        for id in expired_shared_ids {
            self.release_shared(&id, grace).await;
        }
    }

    #[cfg(test)]
    async fn token_count(&self) -> usize {
        self.inner.lock().await.tokens.len()
    }

    #[cfg(test)]
    async fn shared_refcount(&self, id: &str) -> Option<u64> {
        self.inner.lock().await.shared.get(id).map(|e| e.refcount)
    }
}

/// Best-effort delete with a bounded number of retries; final failure is
/// logged and swallowed, matching the spec's "not reported to the client"
/// semantics for temp-file cleanup.
async fn delete_with_retries(path: &PathBuf) {
    for attempt in 0..DELETE_RETRY_ATTEMPTS {
        match tokio::fs::remove_file(path).await {
            Ok(()) => return,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                if attempt + 1 == DELETE_RETRY_ATTEMPTS {
                    warn!(path = %path.display(), error = %e, "failed to delete transfer temp file");
                } else {
                    tokio::time::sleep(DELETE_RETRY_BACKOFF).await;
                }
            }
        }
    }
}
