use chrono::{SecondsFormat, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::{
    Document, Event, FeedItem, FeedSync, Subscription, TYPE_DOCUMENT, TYPE_FEED_ITEM,
    TYPE_FEED_SYNC, TYPE_SUBSCRIPTION,
};
use crate::pubsub::{meta, Message};

/// MIME type recorded on every event message and checked by the router's
/// type filter.
pub const MIME_MSGPACK: &str = "application/msgpack";

#[derive(Debug, Error)]
pub enum EventError {
    /// The `type_name` metadata names no known event kind
    #[error("cannot unmarshal message type {0:?}")]
    UnknownType(String),
    /// A typed unmarshal found a different event kind than requested
    #[error("message does not contain a {expected} event")]
    UnexpectedType { expected: &'static str },
    #[error("could not encode event: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("cannot unmarshal {type_name}: {source}")]
    Decode {
        type_name: String,
        #[source]
        source: rmp_serde::decode::Error,
    },
}

/// Serializes an event into a message ready for publishing.
///
/// # Returns
///
/// A message whose payload is message pack with named fields, whose id is
/// a fresh UUIDv7 so ids sort by creation time, and whose envelope carries
/// the MIME type, event type name, schema version, and an RFC 3339
/// creation timestamp with nanosecond precision.
///
/// # Errors
///
/// Returns [`EventError::Encode`] if the event cannot be serialized.
pub fn marshal(event: &Event) -> Result<Message, EventError> {
    let payload = match event {
        Event::Subscription(e) => rmp_serde::to_vec_named(e)?,
        Event::FeedSync(e) => rmp_serde::to_vec_named(e)?,
        Event::FeedItem(e) => rmp_serde::to_vec_named(e)?,
        Event::Document(e) => rmp_serde::to_vec_named(e)?,
    };

    let mut msg = Message::new(Uuid::now_v7().to_string(), payload);
    msg.metadata.set(meta::MIME, MIME_MSGPACK);
    msg.metadata.set(meta::TYPE_NAME, event.type_name());
    msg.metadata.set(meta::TYPE_VERSION, event.type_version());
    msg.metadata.set(
        meta::CREATED,
        Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
    );
    Ok(msg)
}

/// Deserializes a message into the event kind named by its `type_name`
/// metadata.
///
/// # Errors
///
/// - [`EventError::UnknownType`] - The `type_name` metadata names no known
///   event kind
/// - [`EventError::Decode`] - The payload is not valid message pack for
///   the named kind
pub fn unmarshal(msg: &Message) -> Result<Event, EventError> {
    let type_name = msg.metadata.get(meta::TYPE_NAME);
    match type_name {
        TYPE_SUBSCRIPTION => Ok(Event::Subscription(decode(type_name, &msg.payload)?)),
        TYPE_FEED_SYNC => Ok(Event::FeedSync(decode(type_name, &msg.payload)?)),
        TYPE_FEED_ITEM => Ok(Event::FeedItem(decode(type_name, &msg.payload)?)),
        TYPE_DOCUMENT => Ok(Event::Document(decode(type_name, &msg.payload)?)),
        unknown => Err(EventError::UnknownType(unknown.to_string())),
    }
}

fn decode<T: serde::de::DeserializeOwned>(type_name: &str, payload: &[u8]) -> Result<T, EventError> {
    rmp_serde::from_slice(payload).map_err(|source| EventError::Decode {
        type_name: type_name.to_string(),
        source,
    })
}

impl Subscription {
    /// Unmarshals a message that must contain a Subscription event.
    ///
    /// # Errors
    ///
    /// Fails as [`unmarshal`] does, and with
    /// [`EventError::UnexpectedType`] when the message holds a different
    /// event kind.
    pub fn from_message(msg: &Message) -> Result<Subscription, EventError> {
        match unmarshal(msg)? {
            Event::Subscription(event) => Ok(event),
            _ => Err(EventError::UnexpectedType {
                expected: TYPE_SUBSCRIPTION,
            }),
        }
    }
}

impl FeedSync {
    /// Unmarshals a message that must contain a FeedSync event.
    ///
    /// # Errors
    ///
    /// Fails as [`unmarshal`] does, and with
    /// [`EventError::UnexpectedType`] when the message holds a different
    /// event kind.
    pub fn from_message(msg: &Message) -> Result<FeedSync, EventError> {
        match unmarshal(msg)? {
            Event::FeedSync(event) => Ok(event),
            _ => Err(EventError::UnexpectedType {
                expected: TYPE_FEED_SYNC,
            }),
        }
    }
}

impl FeedItem {
    /// Unmarshals a message that must contain a FeedItem event.
    ///
    /// # Errors
    ///
    /// Fails as [`unmarshal`] does, and with
    /// [`EventError::UnexpectedType`] when the message holds a different
    /// event kind.
    pub fn from_message(msg: &Message) -> Result<FeedItem, EventError> {
        match unmarshal(msg)? {
            Event::FeedItem(event) => Ok(event),
            _ => Err(EventError::UnexpectedType {
                expected: TYPE_FEED_ITEM,
            }),
        }
    }
}

impl Document {
    /// Unmarshals a message that must contain a Document event.
    ///
    /// # Errors
    ///
    /// Fails as [`unmarshal`] does, and with
    /// [`EventError::UnexpectedType`] when the message holds a different
    /// event kind.
    pub fn from_message(msg: &Message) -> Result<Document, EventError> {
        match unmarshal(msg)? {
            Event::Document(event) => Ok(event),
            _ => Err(EventError::UnexpectedType {
                expected: TYPE_DOCUMENT,
            }),
        }
    }
}
