//! Distributed stream registry: a local handle map plus a cross-process
//! `PubSub` channel, so a `signal` issued on one instance reaches the
//! instance that actually owns the stream.

use super::{new_stream_id, local::LocalRegistry, Handle, PubSub, StreamRegistry};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct DistributedRegistry<P: PubSub + 'static> {
    local: Arc<LocalRegistry>,
    pubsub: Arc<P>,
}

impl<P: PubSub + 'static> DistributedRegistry<P> {
    pub fn new(pubsub: Arc<P>, ttl: Duration) -> Arc<Self> {
        let registry = Arc::new(Self {
            local: LocalRegistry::new(ttl),
            pubsub,
        });
        registry.clone().spawn_relay();
        registry
    }

    /// Relay every signal arriving over the pub/sub channel to the local
    /// handle map. A thread id with no local handle is a harmless miss —
    /// the signal was meant for a different instance.
    fn spawn_relay(self: Arc<Self>) {
        let mut rx = self.pubsub.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(thread_id) => {
                        if let Some(handle) = self.local.local_handle(&thread_id) {
                            handle.token.cancel();
                        } else {
                            debug!(thread_id, "cancellation signal for thread with no local handle");
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

#[async_trait]
impl<P: PubSub + 'static> StreamRegistry for DistributedRegistry<P> {
    async fn register(&self, thread_id: &str) -> Handle {
        let handle = Handle {
            stream_id: new_stream_id(),
            token: CancellationToken::new(),
        };
        self.local.insert(thread_id, handle.clone());
        handle
    }

    async fn signal(&self, thread_id: &str) {
        // Fire the local handle if this instance owns the stream, and
        // publish unconditionally so any other instance does the same.
        if let Some(handle) = self.local.local_handle(thread_id) {
            handle.token.cancel();
        }
        self.pubsub.publish(thread_id).await;
    }

    async fn unregister(&self, thread_id: &str) {
        self.local.remove(thread_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LocalPubSub;

    #[tokio::test]
    async fn signal_reaches_handle_via_pubsub_relay() {
        let pubsub = Arc::new(LocalPubSub::new());
        let registry = DistributedRegistry::new(pubsub, Duration::from_secs(3600));
        let handle = registry.register("t1").await;

        registry.signal("t1").await;

        // The relay task runs on its own spawn; give it a turn.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(handle.token.is_cancelled());
    }
}
