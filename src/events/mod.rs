//! Typed events and their serialization.
//!
//! Baleen emits four event kinds: operator-issued [`Subscription`]s, one
//! [`FeedSync`] per synchronization attempt, one [`FeedItem`] per parsed
//! entry, and one [`Document`] per fetched article. Events are serialized
//! with message pack -- a binary, JSON-compatible format that is slightly
//! larger than protocol buffers but much simpler to evolve -- and carried
//! opaquely in message payloads with the type name, schema version, and
//! creation time in the envelope metadata.

mod codec;

pub use codec::{marshal, unmarshal, EventError, MIME_MSGPACK};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type names carried in the `type_name` metadata key.
pub const TYPE_SUBSCRIPTION: &str = "Subscription";
pub const TYPE_FEED_SYNC: &str = "FeedSync";
pub const TYPE_FEED_ITEM: &str = "FeedItem";
pub const TYPE_DOCUMENT: &str = "Document";

/// Schema versions carried in the `type_version` metadata key.
pub const VERSION_SUBSCRIPTION: &str = "1.0.0";
pub const VERSION_FEED_SYNC: &str = "1.0.0";
pub const VERSION_FEED_ITEM: &str = "1.0.0";
pub const VERSION_DOCUMENT: &str = "1.0.0";

/// An operator-issued declaration that a feed URL should be tracked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// A unique ID for the feed (optional; assigned on first sight)
    #[serde(default)]
    pub feed_id: String,
    /// The title of the subscription
    #[serde(default)]
    pub title: String,
    /// Either "rss" or "atom", empty if unknown
    #[serde(default)]
    pub feed_type: String,
    /// The URL to the feed (xmlUrl in OPML)
    #[serde(default)]
    pub feed_url: String,
    /// The URL to the site (htmlUrl in OPML)
    #[serde(default)]
    pub site_url: String,
}

/// The outcome of one synchronization attempt for one feed, successful or
/// not. On success it also carries the feed-level metadata from the parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSync {
    pub feed_id: String,
    pub etag: String,
    pub last_modified: String,
    pub active: bool,
    pub status_code: u16,
    pub error: String,
    pub synced_at: DateTime<Utc>,
    pub feed_items: i64,
    pub title: String,
    pub description: String,
    pub link: String,
    pub links: Vec<String>,
    pub feed_link: String,
    pub updated: String,
    pub published: String,
    pub language: String,
    pub copyright: String,
    pub generator: String,
    pub categories: Vec<String>,
    pub feed_type: String,
    pub feed_version: String,
}

impl Default for FeedSync {
    fn default() -> Self {
        FeedSync {
            feed_id: String::new(),
            etag: String::new(),
            last_modified: String::new(),
            active: false,
            status_code: 0,
            error: String::new(),
            synced_at: DateTime::UNIX_EPOCH,
            feed_items: 0,
            title: String::new(),
            description: String::new(),
            link: String::new(),
            links: Vec::new(),
            feed_link: String::new(),
            updated: String::new(),
            published: String::new(),
            language: String::new(),
            copyright: String::new(),
            generator: String::new(),
            categories: Vec::new(),
            feed_type: String::new(),
            feed_version: String::new(),
        }
    }
}

/// One entry of a successfully parsed feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub feed_id: String,
    pub title: String,
    pub description: String,
    pub content: String,
    pub link: String,
    pub updated: String,
    pub published: String,
    pub guid: String,
    pub authors: Vec<String>,
    pub image: String,
    pub categories: Vec<String>,
    pub enclosures: Vec<String>,
}

/// A fetched article body plus metadata, derived from a [`FeedItem`].
///
/// Emitted even when the article fetch failed with an HTTP error so that
/// downstream consumers observe the negative outcome (`active` false with
/// the status code and status line recorded).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub etag: String,
    pub last_modified: String,
    pub active: bool,
    pub status_code: u16,
    pub error: String,
    pub fetched_at: DateTime<Utc>,
    pub feed_id: String,
    pub language: String,
    pub year: i32,
    pub month: String,
    pub day: u32,
    pub title: String,
    pub description: String,
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
    pub encoding: String,
    pub link: String,
}

impl Default for Document {
    fn default() -> Self {
        Document {
            etag: String::new(),
            last_modified: String::new(),
            active: false,
            status_code: 0,
            error: String::new(),
            fetched_at: DateTime::UNIX_EPOCH,
            feed_id: String::new(),
            language: String::new(),
            year: 0,
            month: String::new(),
            day: 0,
            title: String::new(),
            description: String::new(),
            content: Vec::new(),
            encoding: String::new(),
            link: String::new(),
        }
    }
}

/// A tagged sum over the four event kinds, dispatched on the `type_name`
/// metadata key at unmarshal time.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Subscription(Subscription),
    FeedSync(FeedSync),
    FeedItem(FeedItem),
    Document(Document),
}

impl Event {
    /// The type name recorded in message metadata.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Subscription(_) => TYPE_SUBSCRIPTION,
            Event::FeedSync(_) => TYPE_FEED_SYNC,
            Event::FeedItem(_) => TYPE_FEED_ITEM,
            Event::Document(_) => TYPE_DOCUMENT,
        }
    }

    /// The schema version recorded in message metadata.
    pub fn type_version(&self) -> &'static str {
        match self {
            Event::Subscription(_) => VERSION_SUBSCRIPTION,
            Event::FeedSync(_) => VERSION_FEED_SYNC,
            Event::FeedItem(_) => VERSION_FEED_ITEM,
            Event::Document(_) => VERSION_DOCUMENT,
        }
    }
}

impl From<Subscription> for Event {
    fn from(event: Subscription) -> Self {
        Event::Subscription(event)
    }
}

impl From<FeedSync> for Event {
    fn from(event: FeedSync) -> Self {
        Event::FeedSync(event)
    }
}

impl From<FeedItem> for Event {
    fn from(event: FeedItem) -> Self {
        Event::FeedItem(event)
    }
}

impl From<Document> for Event {
    fn from(event: Document) -> Self {
        Event::Document(event)
    }
}
