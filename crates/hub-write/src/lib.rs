//! Fan-out write dispatch and per-socket write serialization.
//!
//! Two pieces work together: `SafeConn` wraps a single socket's sink behind
//! a mutex so concurrent writers never interleave frames, and
//! `AsyncWriteArbiter` bounds how many fan-out write tasks run concurrently
//! across every socket in the registry, falling back to an inline
//! (backpressured) write once its semaphore is drained.

use futures_util::{Sink, SinkExt};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::warn;

/// Serializes writes to a single socket sink. Cloning shares the same
/// underlying socket and mutex — cheap, intended to be held by every task
/// that might need to write to this connection.
#[derive(Clone)]
pub struct SafeConn<S> {
    inner: Arc<Mutex<S>>,
}

impl<S, Item> SafeConn<S>
where
    S: Sink<Item> + Unpin + Send + 'static,
    S::Error: Send,
    Item: Send + 'static,
{
    pub fn new(sink: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sink)),
        }
    }

    pub async fn send(&self, item: Item) -> Result<(), S::Error> {
        let mut guard = self.inner.lock().await;
        guard.send(item).await
    }
}

/// Bounded semaphore over "enqueue a write task". Built once and shared
/// process-wide; every fan-out broadcast goes through `dispatch`.
pub struct AsyncWriteArbiter {
    semaphore: Arc<Semaphore>,
}

impl AsyncWriteArbiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Runs `task` asynchronously if a permit is free; otherwise runs it
    /// inline, applying backpressure to the caller. `task` must be the
    /// whole unit of work (e.g. one `SafeConn::send` call) since the permit
    /// is held only for its duration.
    pub async fn dispatch<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                tokio::spawn(async move {
                    task.await;
                    drop(permit);
                });
            }
            Err(_) => {
                task.await;
            }
        }
    }

    #[cfg(test)]
    fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Convenience used by fan-out call sites: runs `send` on a `SafeConn`
/// through the arbiter, logging (not propagating) any write error since
/// transient write failures to a socket are not retried — the connection is
/// expected to close on its next read.
pub async fn dispatch_send<S, Item>(arbiter: &AsyncWriteArbiter, conn: SafeConn<S>, item: Item, label: &'static str)
where
    S: Sink<Item> + Unpin + Send + 'static,
    S::Error: Send + std::fmt::Display,
    Item: Send + 'static,
{
    arbiter
        .dispatch(async move {
            if let Err(e) = conn.send(item).await {
                warn!(label, error = %e, "fan-out write failed");
            }
        })
        .await;
}
