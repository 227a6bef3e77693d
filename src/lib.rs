//! Baleen is a continuously running ingestion service for syndication
//! feeds. Given a dynamic set of feed subscriptions it periodically polls
//! each feed with bandwidth-conservative conditional HTTP, derives per-item
//! metadata, fetches the full HTML body of each linked article, and emits
//! typed event streams -- feed syncs, feed items, and documents -- for
//! downstream consumers to persist or forward.

pub mod config;
pub mod events;
pub mod fetch;
pub mod metrics;
pub mod opml;
pub mod posts;
pub mod pubsub;
pub mod router;
pub mod service;
pub mod sync;
pub mod version;

pub use config::Config;
pub use service::Baleen;
