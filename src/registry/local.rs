//! In-process stream registry: a single server instance's view of in-flight
//! streams. Used standalone in tests and as the local layer underneath the
//! distributed registry.

use super::{new_stream_id, Entry, Handle, StreamRegistry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub struct LocalRegistry {
    handles: RwLock<HashMap<String, Entry>>,
    ttl: Duration,
}

impl LocalRegistry {
    /// Builds the registry and spawns its own periodic sweep task, the same
    /// self-spawning shape `DistributedRegistry::new` uses for its relay.
    pub fn new(ttl: Duration) -> Arc<Self> {
        let registry = Arc::new(Self {
            handles: RwLock::new(HashMap::new()),
            ttl,
        });
        registry.clone().spawn_sweeper();
        registry
    }

    fn spawn_sweeper(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.ttl / 4);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                self.sweep();
            }
        });
    }

    pub(crate) fn local_handle(&self, thread_id: &str) -> Option<Handle> {
        self.sweep();
        self.handles
            .read()
            .unwrap()
            .get(thread_id)
            .map(|e| e.handle.clone())
    }

    pub(crate) fn insert(&self, thread_id: &str, handle: Handle) {
        self.handles.write().unwrap().insert(
            thread_id.to_string(),
            Entry {
                handle,
                last_touched: Instant::now(),
            },
        );
    }

    pub(crate) fn remove(&self, thread_id: &str) {
        self.handles.write().unwrap().remove(thread_id);
    }

    fn sweep(&self) {
        let mut handles = self.handles.write().unwrap();
        let ttl = self.ttl;
        handles.retain(|_, entry| entry.last_touched.elapsed() < ttl);
    }
}

#[async_trait]
impl StreamRegistry for LocalRegistry {
    async fn register(&self, thread_id: &str) -> Handle {
        let handle = Handle {
            stream_id: new_stream_id(),
            token: CancellationToken::new(),
        };
        self.insert(thread_id, handle.clone());
        handle
    }

    async fn signal(&self, thread_id: &str) {
        if let Some(handle) = self.local_handle(thread_id) {
            handle.token.cancel();
        }
    }

    async fn unregister(&self, thread_id: &str) {
        self.remove(thread_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_cancels_registered_handle() {
        let registry = LocalRegistry::new(Duration::from_secs(3600));
        let handle = registry.register("t1").await;
        assert!(!handle.token.is_cancelled());

        registry.signal("t1").await;
        assert!(handle.token.is_cancelled());
    }

    #[tokio::test]
    async fn signal_on_unknown_thread_is_a_noop() {
        let registry = LocalRegistry::new(Duration::from_secs(3600));
        registry.signal("never-registered").await;
    }

    #[tokio::test]
    async fn unregister_then_signal_has_no_effect() {
        let registry = LocalRegistry::new(Duration::from_secs(3600));
        let handle = registry.register("t1").await;
        registry.unregister("t1").await;
        registry.signal("t1").await;
        assert!(!handle.token.is_cancelled());
    }
}
