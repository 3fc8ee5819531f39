//! Channel registry for SUBSCRIBE / UNSUBSCRIBE / PUBLISH.
//!
//! Each subscriber is its connection's outbound sender; PUBLISH pushes the
//! encoded `message` frame straight into every subscriber's write queue.
//! A subscriber whose connection has gone away fails the send and is pruned
//! on the spot.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

pub type ConnId = u64;

#[derive(Default)]
pub struct PubSub {
    channels: RwLock<HashMap<String, HashMap<ConnId, UnboundedSender<Vec<u8>>>>>,
}

impl PubSub {
    pub fn new() -> Self {
        PubSub::default()
    }

    pub async fn subscribe(&self, channel: &str, conn_id: ConnId, tx: UnboundedSender<Vec<u8>>) {
        let mut channels = self.channels.write().await;
        channels
            .entry(channel.to_owned())
            .or_default()
            .insert(conn_id, tx);
        debug!(channel, conn_id, "subscribed");
    }

    pub async fn unsubscribe(&self, channel: &str, conn_id: ConnId) {
        let mut channels = self.channels.write().await;
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.remove(&conn_id);
            if subscribers.is_empty() {
                channels.remove(channel);
            }
        }
    }

    /// Deliver `frame` to every subscriber of `channel`, pruning dead ones.
    /// Returns the number of recipients.
    pub async fn publish(&self, channel: &str, frame: &[u8]) -> usize {
        let mut channels = self.channels.write().await;
        let Some(subscribers) = channels.get_mut(channel) else {
            return 0;
        };
        let before = subscribers.len();
        subscribers.retain(|_, tx| tx.send(frame.to_vec()).is_ok());
        let delivered = subscribers.len();
        if delivered < before {
            debug!(channel, pruned = before - delivered, "dropped dead subscribers");
        }
        if subscribers.is_empty() {
            channels.remove(channel);
        }
        delivered
    }

    /// Remove a closing connection from every channel.
    pub async fn drop_connection(&self, conn_id: ConnId) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, subscribers| {
            subscribers.remove(&conn_id);
            !subscribers.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let pubsub = PubSub::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        pubsub.subscribe("news", 1, tx1).await;
        pubsub.subscribe("news", 2, tx2).await;

        let delivered = pubsub.publish("news", b"payload").await;
        assert_eq!(delivered, 2);
        assert_eq!(rx1.recv().await.unwrap(), b"payload");
        assert_eq!(rx2.recv().await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn publish_to_an_empty_channel_reaches_nobody() {
        let pubsub = PubSub::new();
        assert_eq!(pubsub.publish("void", b"x").await, 0);
    }

    #[tokio::test]
    async fn dead_subscribers_are_pruned() {
        let pubsub = PubSub::new();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        pubsub.subscribe("news", 1, tx).await;
        assert_eq!(pubsub.publish("news", b"x").await, 0);
    }

    #[tokio::test]
    async fn unsubscribe_and_drop_remove_the_connection() {
        let pubsub = PubSub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        pubsub.subscribe("a", 7, tx.clone()).await;
        pubsub.subscribe("b", 7, tx).await;

        pubsub.unsubscribe("a", 7).await;
        assert_eq!(pubsub.publish("a", b"x").await, 0);
        assert_eq!(pubsub.publish("b", b"y").await, 1);
        assert_eq!(rx.recv().await.unwrap(), b"y");

        pubsub.drop_connection(7).await;
        assert_eq!(pubsub.publish("b", b"z").await, 0);
    }
}
