//! Cross-process fan-out of serialized events.

use crate::error::MetadataResult;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

/// Well-known topic every instance publishes to.
pub const EVENTS_TOPIC: &str = "teldrive_events";

/// Payloads received from the bus.
pub type BusStream = Pin<Box<dyn Stream<Item = MetadataResult<String>> + Send>>;

/// Publish/subscribe transport for event payloads.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, payload: &str) -> MetadataResult<()>;

    /// Open a new subscription. The stream ends when the transport drops.
    async fn subscribe(&self) -> MetadataResult<BusStream>;
}

/// In-process bus for single-instance deployments and tests.
pub struct LocalEventBus {
    tx: broadcast::Sender<String>,
}

impl LocalEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, payload: &str) -> MetadataResult<()> {
        // No receivers is not an error.
        let _ = self.tx.send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self) -> MetadataResult<BusStream> {
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(|item| async move {
            match item {
                Ok(payload) => Some(Ok(payload)),
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event bus subscriber lagged");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_bus_fans_out() {
        let bus = LocalEventBus::default();
        let mut a = bus.subscribe().await.unwrap();
        let mut b = bus.subscribe().await.unwrap();
        bus.publish("hello").await.unwrap();
        assert_eq!(a.next().await.unwrap().unwrap(), "hello");
        assert_eq!(b.next().await.unwrap().unwrap(), "hello");
    }
}
