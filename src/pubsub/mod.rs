//! Message envelope and broker adapters.
//!
//! Baleen's topology is three topics on an external message broker:
//! subscriptions flow into the feed sync handler, which emits feed events,
//! which flow into the post fetch handler, which emits document events. The
//! broker itself is abstracted behind the [`Publisher`] and [`Subscriber`]
//! traits; the [`MemoryBroker`] implements both for single-process operation
//! and tests.
//!
//! Delivery is at-least-once with explicit acknowledgement: a [`Message`]
//! carries a receipt handle, and whichever of `ack`/`nack` is called first
//! wins. Redelivery of nacked messages is the broker's contract, not the
//! router's.

mod memory;

pub use memory::MemoryBroker;

use async_trait::async_trait;
use futures::stream::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Names of the topics in the ingestion topology.
pub const TOPIC_SUBSCRIPTIONS: &str = "io.rotational.baleen/subscriptions";
pub const TOPIC_FEEDS: &str = "io.rotational.baleen/feeds";
pub const TOPIC_DOCUMENTS: &str = "io.rotational.baleen/documents";

/// Metadata keys required on every message envelope.
pub mod meta {
    pub const MIME: &str = "mime";
    pub const TYPE_NAME: &str = "type_name";
    pub const TYPE_VERSION: &str = "type_version";
    pub const CREATED: &str = "created";
    pub const CORRELATION_ID: &str = "correlation_id";
}

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("topic {0:?} is closed")]
    Closed(String),
}

/// String key/value metadata attached to a message.
///
/// Reads of missing keys return the empty string so metadata handling stays
/// branch-free at the call sites, mirroring how absent HTTP headers read.
#[derive(Debug, Clone, Default)]
pub struct Metadata(HashMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Metadata::default()
    }

    /// The value for `key`, or `""` when unset.
    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or_default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Acknowledgement state of a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    Pending,
    Acked,
    Nacked,
}

/// The unit of delivery: an opaque payload plus envelope metadata.
///
/// Cloning a message shares its receipt, so a handle kept by a test or a
/// router task observes the same acknowledgement state. Brokers fanning out
/// to several subscribers hand each one an independent [`copy`](Message::copy)
/// instead.
#[derive(Debug, Clone)]
pub struct Message {
    /// Unique, sortable message identifier.
    pub uuid: String,
    /// Serialized event bytes.
    pub payload: Vec<u8>,
    /// Envelope metadata (see [`meta`]).
    pub metadata: Metadata,
    receipt: Arc<watch::Sender<Receipt>>,
}

impl Message {
    pub fn new(uuid: impl Into<String>, payload: Vec<u8>) -> Self {
        let (tx, _) = watch::channel(Receipt::Pending);
        Message {
            uuid: uuid.into(),
            payload,
            metadata: Metadata::new(),
            receipt: Arc::new(tx),
        }
    }

    /// Acknowledges the message. Returns false if it was already settled.
    pub fn ack(&self) -> bool {
        self.settle(Receipt::Acked)
    }

    /// Negatively acknowledges the message. Returns false if already settled.
    pub fn nack(&self) -> bool {
        self.settle(Receipt::Nacked)
    }

    fn settle(&self, outcome: Receipt) -> bool {
        self.receipt.send_if_modified(|receipt| {
            if *receipt == Receipt::Pending {
                *receipt = outcome;
                true
            } else {
                false
            }
        })
    }

    /// Current acknowledgement state.
    pub fn receipt(&self) -> Receipt {
        *self.receipt.borrow()
    }

    /// Waits until the message is acked or nacked and returns the outcome.
    pub async fn settled(&self) -> Receipt {
        let mut rx = self.receipt.subscribe();
        let outcome = match rx.wait_for(|receipt| *receipt != Receipt::Pending).await {
            Ok(receipt) => *receipt,
            // The sender cannot drop while self holds it, but stay total.
            Err(_) => self.receipt(),
        };
        outcome
    }

    /// A copy with the same envelope but a fresh, unsettled receipt. Used by
    /// brokers delivering one published message to several subscribers.
    pub fn copy(&self) -> Message {
        let (tx, _) = watch::channel(Receipt::Pending);
        Message {
            uuid: self.uuid.clone(),
            payload: self.payload.clone(),
            metadata: self.metadata.clone(),
            receipt: Arc::new(tx),
        }
    }
}

/// A stream of delivered messages for one subscription.
pub type MessageStream = Pin<Box<dyn Stream<Item = Message> + Send>>;

/// Sends messages to a topic.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes the messages to the topic, in order.
    ///
    /// # Errors
    ///
    /// Implementations fail when the topic or the broker connection is no
    /// longer usable; delivery with no subscribers is not an error.
    async fn publish(&self, topic: &str, messages: Vec<Message>) -> Result<(), PubSubError>;
}

/// Receives messages from a topic.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Opens a subscription on the topic.
    ///
    /// # Returns
    ///
    /// A stream of delivered messages; the stream ends when the broker
    /// closes the subscription.
    ///
    /// # Errors
    ///
    /// Implementations fail when the subscription cannot be established.
    async fn subscribe(&self, topic: &str) -> Result<MessageStream, PubSubError>;
}
