//! Stream Registry: cross-process cancellation handles keyed by `threadId`.
//!
//! Grounded on the handle-management shape of the teacher's
//! `runtime::RuntimeManager` (`RwLock<HashMap<String, ConversationHandle>>`,
//! `get_or_create`/`send_event`/`subscribe`), generalized from a
//! conversation-runtime handle to a bare cancellation handle plus a
//! cross-process signal (see `pubsub`).

mod distributed;
mod local;
mod pubsub;

pub use distributed::DistributedRegistry;
pub use local::LocalRegistry;
pub use pubsub::{LocalPubSub, PubSub, RedisPubSub};

use async_trait::async_trait;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A cancellation handle for one in-flight stream, plus the `streamId`
/// allocated for it at registration time. `stream_id` is threaded unchanged
/// through the `metadata` and `done` events of that stream (SPEC_FULL.md
/// Design Notes: the two must agree within a single stream).
#[derive(Clone)]
pub struct Handle {
    pub stream_id: String,
    pub token: CancellationToken,
}

#[derive(Clone)]
pub(crate) struct Entry {
    pub handle: Handle,
    pub last_touched: Instant,
}

/// Contract every registry implementation (local or distributed) provides.
#[async_trait]
pub trait StreamRegistry: Send + Sync {
    /// Allocate a cancellation handle for `thread_id`. Replaces any existing
    /// handle for the same thread (a prior stream on this thread is assumed
    /// to have already been unregistered by its own cleanup guard).
    async fn register(&self, thread_id: &str) -> Handle;

    /// Best-effort, idempotent: fire cancellation for `thread_id` if a handle
    /// exists anywhere in the deployment. No error if none exists.
    async fn signal(&self, thread_id: &str);

    /// Remove the local handle for `thread_id`. Always safe to call more
    /// than once.
    async fn unregister(&self, thread_id: &str);
}

/// RAII cleanup so `unregister` runs on every exit path (success, error,
/// cancel, panic), mirroring the teacher's reliance on drop guards for
/// cleanup that must run unconditionally.
pub struct RegistrationGuard<R: StreamRegistry + ?Sized + 'static> {
    registry: std::sync::Arc<R>,
    thread_id: String,
}

impl<R: StreamRegistry + ?Sized + 'static> RegistrationGuard<R> {
    pub fn new(registry: std::sync::Arc<R>, thread_id: String) -> Self {
        Self { registry, thread_id }
    }
}

impl<R: StreamRegistry + ?Sized + 'static> Drop for RegistrationGuard<R> {
    fn drop(&mut self) {
        let registry = self.registry.clone();
        let thread_id = std::mem::take(&mut self.thread_id);
        tokio::spawn(async move {
            registry.unregister(&thread_id).await;
        });
    }
}

pub fn new_stream_id() -> String {
    Uuid::new_v4().to_string()
}
