use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{Message, MessageStream, PubSubError, Publisher, Subscriber};

/// An in-process broker implementing both [`Publisher`] and [`Subscriber`].
///
/// Intended for single-process operation and tests: messages published to a
/// topic fan out to every live subscription, each receiving an independent
/// copy with its own receipt. There is no persistence and no redelivery --
/// a message published with no subscribers is dropped, and a nacked copy is
/// gone. Durable at-least-once delivery is what the external broker is for.
#[derive(Default)]
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Message>>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker::default()
    }

    /// The number of live subscriptions on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.topics.lock().expect("broker lock poisoned");
        topics.get(topic).map(Vec::len).unwrap_or(0)
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(&self, topic: &str, messages: Vec<Message>) -> Result<(), PubSubError> {
        let mut topics = self.topics.lock().expect("broker lock poisoned");
        let Some(subscribers) = topics.get_mut(topic) else {
            tracing::trace!(topic, dropped = messages.len(), "no subscribers on topic");
            return Ok(());
        };

        for message in &messages {
            // Prune subscriptions whose receiver side has gone away.
            subscribers.retain(|sender| sender.send(message.copy()).is_ok());
        }

        if subscribers.is_empty() {
            topics.remove(topic);
        }
        Ok(())
    }
}

#[async_trait]
impl Subscriber for MemoryBroker {
    async fn subscribe(&self, topic: &str) -> Result<MessageStream, PubSubError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.topics.lock().expect("broker lock poisoned");
        topics.entry(topic.to_string()).or_default().push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}
