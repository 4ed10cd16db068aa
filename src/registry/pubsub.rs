//! Cross-process signal transport for the distributed stream registry.
//!
//! The teacher has no pub/sub primitive of its own; `redis` is brought in
//! from `other_examples/manifests/tasker-systems-tasker-core/Cargo.toml`,
//! which already depends on `redis` with the same `tokio-comp` +
//! `connection-manager` features used here.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// A single logical channel shared by every instance in a deployment.
/// Messages are thread ids; delivery is at-most-once and receivers are
/// expected to treat a spurious or duplicate delivery as harmless.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, thread_id: &str);
    /// Subscribe and receive a stream of published thread ids. Each call
    /// gets an independent receiver.
    fn subscribe(&self) -> broadcast::Receiver<String>;
}

/// Single-process pub/sub, usable standalone or in tests. Equivalent to the
/// distributed registry's local layer talking to itself.
pub struct LocalPubSub {
    tx: broadcast::Sender<String>,
}

impl Default for LocalPubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalPubSub {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self { tx }
    }
}

#[async_trait]
impl PubSub for LocalPubSub {
    async fn publish(&self, thread_id: &str) {
        // No subscribers is not an error; `send` only fails when the channel
        // has zero receivers, which is the common case between streams.
        let _ = self.tx.send(thread_id.to_string());
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

/// Redis-backed pub/sub for a multi-instance deployment. One `PUBLISH` per
/// signal on a single channel keyed by deployment name; every instance
/// `SUBSCRIBE`s the same channel and filters locally by `threadId`.
pub struct RedisPubSub {
    client: redis::Client,
    channel: String,
    local: broadcast::Sender<String>,
}

impl RedisPubSub {
    pub fn new(redis_url: &str, channel: impl Into<String>) -> redis::RedisResult<Arc<Self>> {
        let client = redis::Client::open(redis_url)?;
        let (local, _rx) = broadcast::channel(1024);
        let pubsub = Arc::new(Self {
            client,
            channel: channel.into(),
            local,
        });
        pubsub.clone().spawn_listener();
        Ok(pubsub)
    }

    fn spawn_listener(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                match self.listen_once().await {
                    Ok(()) => {}
                    Err(e) => {
                        warn!(error = %e, "redis pub/sub listener disconnected, retrying");
                        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                    }
                }
            }
        });
    }

    async fn listen_once(&self) -> redis::RedisResult<()> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let thread_id: String = msg.get_payload().unwrap_or_default();
            if !thread_id.is_empty() {
                let _ = self.local.send(thread_id);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, thread_id: &str) {
        let client = self.client.clone();
        let channel = self.channel.clone();
        let thread_id = thread_id.to_string();
        // PUBLISH always happens even if no subscriber is currently mid-flight
        // on this thread; a missed delivery is harmless (SPEC_FULL.md 4.2).
        if let Err(e) = publish(client, channel, thread_id).await {
            warn!(error = %e, "failed to publish cancellation signal");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.local.subscribe()
    }
}

async fn publish(client: redis::Client, channel: String, thread_id: String) -> redis::RedisResult<()> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    redis::cmd("PUBLISH")
        .arg(&channel)
        .arg(&thread_id)
        .query_async(&mut conn)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_pubsub_delivers_to_subscriber() {
        let pubsub = LocalPubSub::new();
        let mut rx = pubsub.subscribe();
        pubsub.publish("t1").await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received, "t1");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let pubsub = LocalPubSub::new();
        pubsub.publish("t1").await;
    }
}
