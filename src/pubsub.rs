//! Pub/sub collaborator
//!
//! Per-key publish and subscribe. A [`Subscription`] yields payloads in
//! publish order until it is closed or dropped. Rooms and hubs only ever
//! exchange encoded payloads through this seam, never session references.
//!
//! Two backends:
//! - [`MemoryPubSub`]: single process, one `broadcast` channel per key
//! - `RedisPubSub` (feature `redis`): fan-out across processes

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::error::PubSubError;

/// Items buffered per subscription before the forwarder waits on the consumer.
const SUBSCRIPTION_BUFFER: usize = 256;

/// Publish/subscribe transport, safe for concurrent use
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish a payload to every current subscriber of `channel`
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PubSubError>;

    /// Open a subscription to `channel`; it is live when this returns
    async fn subscribe(&self, channel: &str) -> Result<Subscription, PubSubError>;
}

/// Handle to one live subscription
///
/// Dropping the handle (or calling [`Subscription::close`]) stops the
/// backend forwarder task.
pub struct Subscription {
    channel: String,
    receiver: mpsc::Receiver<Result<String, PubSubError>>,
    _guard: DropGuard,
}

impl Subscription {
    pub fn new(
        channel: impl Into<String>,
        receiver: mpsc::Receiver<Result<String, PubSubError>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channel: channel.into(),
            receiver,
            _guard: cancel.drop_guard(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next payload, or `None` once the subscription has ended
    pub async fn next(&mut self) -> Option<Result<String, PubSubError>> {
        self.receiver.recv().await
    }

    pub fn close(self) {
        debug!(channel = %self.channel, "Subscription closed");
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish()
    }
}

/// In-process pub/sub
#[derive(Debug)]
pub struct MemoryPubSub {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::with_capacity(SUBSCRIPTION_BUFFER)
    }

    /// `capacity` bounds how far a subscriber may lag before it skips payloads
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of live subscribers on `channel`
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PubSubError> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = channels.get(channel) else {
            return Ok(());
        };
        if sender.send(payload.to_string()).is_err() {
            // Every subscriber is gone
            channels.remove(channel);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, PubSubError> {
        let mut source = {
            let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let key = channel.to_string();

        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = stop.cancelled() => break,
                    received = source.recv() => received,
                };
                let forwarded = match item {
                    Ok(payload) => tx.send(Ok(payload)).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tx.send(Err(PubSubError::Lagged(skipped))).await
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if forwarded.is_err() {
                    break;
                }
            }
            debug!(channel = %key, "Memory subscription forwarder ended");
        });

        Ok(Subscription::new(channel, rx, cancel))
    }
}

#[cfg(feature = "redis")]
pub use self::redis_backend::RedisPubSub;

#[cfg(feature = "redis")]
mod redis_backend {
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, info};

    use super::{PubSub, Subscription, SUBSCRIPTION_BUFFER};
    use crate::error::PubSubError;

    /// Redis-backed pub/sub for multi-process fan-out
    pub struct RedisPubSub {
        client: redis::Client,
        publisher: redis::aio::MultiplexedConnection,
    }

    impl RedisPubSub {
        pub async fn connect(url: &str) -> Result<Self, PubSubError> {
            let client = redis::Client::open(url)?;
            let publisher = client.get_multiplexed_async_connection().await?;
            info!("Connected to Redis pub/sub at {}", url);
            Ok(Self { client, publisher })
        }
    }

    #[async_trait]
    impl PubSub for RedisPubSub {
        async fn publish(&self, channel: &str, payload: &str) -> Result<(), PubSubError> {
            let mut conn = self.publisher.clone();
            let _receivers: i64 = redis::cmd("PUBLISH")
                .arg(channel)
                .arg(payload)
                .query_async(&mut conn)
                .await?;
            Ok(())
        }

        async fn subscribe(&self, channel: &str) -> Result<Subscription, PubSubError> {
            let mut pubsub = self.client.get_async_pubsub().await?;
            pubsub.subscribe(channel).await?;

            let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
            let cancel = CancellationToken::new();
            let stop = cancel.clone();
            let key = channel.to_string();

            tokio::spawn(async move {
                let mut messages = pubsub.into_on_message();
                loop {
                    let next = tokio::select! {
                        _ = stop.cancelled() => break,
                        next = messages.next() => next,
                    };
                    let Some(msg) = next else {
                        let _ = tx.send(Err(PubSubError::Closed)).await;
                        break;
                    };
                    let item = msg.get_payload::<String>().map_err(PubSubError::from);
                    if tx.send(item).await.is_err() {
                        break;
                    }
                }
                debug!(channel = %key, "Redis subscription forwarder ended");
            });

            Ok(Subscription::new(channel, rx, cancel))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber_in_order() {
        let pubsub = MemoryPubSub::new();
        let mut first = pubsub.subscribe("room-1").await.unwrap();
        let mut second = pubsub.subscribe("room-1").await.unwrap();

        pubsub.publish("room-1", "one").await.unwrap();
        pubsub.publish("room-1", "two").await.unwrap();

        for sub in [&mut first, &mut second] {
            let a = timeout(Duration::from_secs(1), sub.next()).await.unwrap();
            let b = timeout(Duration::from_secs(1), sub.next()).await.unwrap();
            assert_eq!(a.unwrap().unwrap(), "one");
            assert_eq!(b.unwrap().unwrap(), "two");
        }
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let pubsub = MemoryPubSub::new();
        let mut sub = pubsub.subscribe("room-1").await.unwrap();

        pubsub.publish("room-2", "elsewhere").await.unwrap();
        pubsub.publish("room-1", "here").await.unwrap();

        let item = timeout(Duration::from_secs(1), sub.next()).await.unwrap();
        assert_eq!(item.unwrap().unwrap(), "here");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let pubsub = MemoryPubSub::new();
        assert!(pubsub.publish("nobody", "hello").await.is_ok());
    }

    #[tokio::test]
    async fn test_close_drops_subscriber() {
        let pubsub = MemoryPubSub::new();
        let sub = pubsub.subscribe("room-1").await.unwrap();
        assert_eq!(pubsub.subscriber_count("room-1"), 1);

        sub.close();

        // The forwarder notices the cancellation asynchronously
        timeout(Duration::from_secs(1), async {
            while pubsub.subscriber_count("room-1") > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_lagging_subscriber_reports_skipped_payloads() {
        let pubsub = MemoryPubSub::with_capacity(2);
        let mut sub = pubsub.subscribe("room-1").await.unwrap();

        // Starve the forwarder so the broadcast ring overflows
        for i in 0..(SUBSCRIPTION_BUFFER + 16) {
            pubsub.publish("room-1", &i.to_string()).await.unwrap();
        }

        let mut saw_lag = false;
        while let Ok(Some(item)) = timeout(Duration::from_millis(200), sub.next()).await {
            if matches!(item, Err(PubSubError::Lagged(_))) {
                saw_lag = true;
                break;
            }
        }
        assert!(saw_lag);
    }
}
