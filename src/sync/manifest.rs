use chrono::{DateTime, Utc};
use feed_rs::model::{Entry, FeedType};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::events::{self, Event, Subscription};
use crate::fetch::FeedFetcher;
use crate::metrics;
use crate::pubsub::Message;

/// One tracked feed: its subscription info plus the stateful fetcher that
/// carries the conditional HTTP state across syncs.
pub struct Feed {
    info: Subscription,
    fetcher: FeedFetcher,
}

impl Feed {
    fn new(info: Subscription, fetcher: FeedFetcher) -> Self {
        Feed { info, fetcher }
    }

    pub fn info(&self) -> &Subscription {
        &self.info
    }

    /// Synchronizes the feed.
    ///
    /// An HTTP error -- including 304 Not Modified -- still yields exactly
    /// one FeedSync marking the feed inactive with the status recorded, so
    /// downstream consumers observe every attempt.
    ///
    /// # Returns
    ///
    /// The events to publish, in order: one FeedSync followed by one
    /// FeedItem per parsed entry (none on an HTTP error).
    ///
    /// # Errors
    ///
    /// Transport, parse, and codec errors return with no messages and are
    /// left to the router's retry path.
    pub async fn sync(&mut self) -> anyhow::Result<Vec<Message>> {
        tracing::info!(feed_id = %self.info.feed_id, url = %self.info.feed_url, "synchronizing feed");

        let feed = match self.fetcher.fetch().await {
            Ok(feed) => feed,
            Err(err) if err.is_http() => {
                let status_code = err.status_code().unwrap_or_default();
                let fsync = events::FeedSync {
                    feed_id: self.info.feed_id.clone(),
                    active: false,
                    error: err.status_line().unwrap_or_default().to_string(),
                    status_code,
                    synced_at: Utc::now(),
                    title: self.info.title.clone(),
                    link: self.info.feed_url.clone(),
                    feed_type: self.info.feed_type.clone(),
                    ..events::FeedSync::default()
                };

                metrics::feed_sync_recorded(status_code);
                return Ok(vec![events::marshal(&Event::FeedSync(fsync))?]);
            }
            Err(err) => return Err(err.into()),
        };

        let mut msgs = Vec::with_capacity(feed.entries.len() + 1);
        let (feed_type, feed_version) = feed_type_version(&feed.feed_type);

        let fsync = events::FeedSync {
            feed_id: self.info.feed_id.clone(),
            etag: self.fetcher.etag().to_string(),
            last_modified: self.fetcher.modified().to_string(),
            active: true,
            status_code: 0,
            error: String::new(),
            synced_at: Utc::now(),
            feed_items: feed.entries.len() as i64,
            title: text(&feed.title),
            description: text(&feed.description),
            link: site_link(&feed.links),
            links: feed.links.iter().map(|link| link.href.clone()).collect(),
            feed_link: self_link(&feed.links),
            updated: timestamp(&feed.updated),
            published: timestamp(&feed.published),
            language: feed.language.clone().unwrap_or_default(),
            copyright: text(&feed.rights),
            generator: feed
                .generator
                .as_ref()
                .map(|generator| generator.content.clone())
                .unwrap_or_default(),
            categories: categories(&feed.categories),
            feed_type: feed_type.to_string(),
            feed_version: feed_version.to_string(),
        };
        msgs.push(events::marshal(&Event::FeedSync(fsync))?);

        for entry in &feed.entries {
            let item = events::FeedItem {
                feed_id: self.info.feed_id.clone(),
                title: text(&entry.title),
                description: text(&entry.summary),
                content: entry
                    .content
                    .as_ref()
                    .and_then(|content| content.body.clone())
                    .unwrap_or_default(),
                link: entry
                    .links
                    .first()
                    .map(|link| link.href.clone())
                    .unwrap_or_default(),
                updated: timestamp(&entry.updated),
                published: timestamp(&entry.published),
                guid: entry.id.clone(),
                authors: author_names(entry),
                image: thumbnail(entry),
                categories: categories(&entry.categories),
                enclosures: enclosures(entry),
            };
            msgs.push(events::marshal(&Event::FeedItem(item))?);
        }

        metrics::feed_sync_recorded(200);
        metrics::feed_items_recorded(&self.info.feed_id, feed.entries.len() as u64);
        Ok(msgs)
    }
}

/// The set of feeds being actively synchronized, keyed by feed URL.
///
/// Both the subscription handler and the background tick loop drive feeds,
/// so each feed sits behind its own lock: contending syncs of the same feed
/// serialize, while different feeds sync freely in parallel. The outer map
/// lock is only ever held for lookups and inserts, never across I/O.
pub struct Manifest {
    client: reqwest::Client,
    feeds: Mutex<HashMap<String, Arc<Mutex<Feed>>>>,
}

impl Manifest {
    /// Creates an empty manifest; `client` is handed to each feed's fetcher.
    pub fn new(client: reqwest::Client) -> Self {
        Manifest {
            client,
            feeds: Mutex::new(HashMap::new()),
        }
    }

    /// Adds or updates a feed, keyed by `feed_url`.
    ///
    /// For an existing feed, each of `feed_id`, `feed_type`, and `site_url`
    /// adopts the incoming value when the stored one is empty or when both
    /// are non-empty and differ. A new feed without a `feed_id` is assigned
    /// a fresh short identifier, stable for the feed's lifetime, and gets a
    /// fresh fetcher with no conditional state.
    ///
    /// # Arguments
    ///
    /// * `info` - The incoming subscription; its `feed_url` is the identity
    ///
    /// # Returns
    ///
    /// The (possibly updated) tracked feed behind its per-feed lock.
    pub async fn add(&self, mut info: Subscription) -> Arc<Mutex<Feed>> {
        let mut feeds = self.feeds.lock().await;

        if let Some(existing) = feeds.get(&info.feed_url) {
            let feed = Arc::clone(existing);
            drop(feeds);

            // Waits out an in-flight sync of this feed before merging.
            let mut locked = feed.lock().await;
            merge_field(&mut locked.info.feed_id, &info.feed_id);
            merge_field(&mut locked.info.feed_type, &info.feed_type);
            merge_field(&mut locked.info.site_url, &info.site_url);
            drop(locked);
            return feed;
        }

        if info.feed_id.is_empty() {
            info.feed_id = short_id();
        }
        let url = info.feed_url.clone();
        let fetcher = FeedFetcher::new(self.client.clone(), &url);
        let feed = Arc::new(Mutex::new(Feed::new(info, fetcher)));
        feeds.insert(url, Arc::clone(&feed));
        metrics::subscriptions_set(feeds.len() as i64);
        feed
    }

    /// The number of tracked feeds.
    pub async fn len(&self) -> usize {
        self.feeds.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.feeds.lock().await.is_empty()
    }

    /// A snapshot of every tracked feed for the tick loop to iterate.
    pub async fn snapshot(&self) -> Vec<Arc<Mutex<Feed>>> {
        self.feeds.lock().await.values().map(Arc::clone).collect()
    }
}

/// Adopt the incoming value when the existing one is empty, or when both
/// are non-empty and disagree.
fn merge_field(existing: &mut String, incoming: &str) {
    if existing.is_empty() || (!incoming.is_empty() && existing.as_str() != incoming) {
        *existing = incoming.to_string();
    }
}

fn short_id() -> String {
    Uuid::now_v7().simple().to_string()
}

fn text(text: &Option<feed_rs::model::Text>) -> String {
    text.as_ref().map(|t| t.content.clone()).unwrap_or_default()
}

fn timestamp(datetime: &Option<DateTime<Utc>>) -> String {
    datetime
        .as_ref()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// The feed's site link: the first alternate (or unqualified) link.
fn site_link(links: &[feed_rs::model::Link]) -> String {
    links
        .iter()
        .find(|link| matches!(link.rel.as_deref(), None | Some("alternate")))
        .map(|link| link.href.clone())
        .unwrap_or_default()
}

/// The feed's self link, when the feed declares one.
fn self_link(links: &[feed_rs::model::Link]) -> String {
    links
        .iter()
        .find(|link| link.rel.as_deref() == Some("self"))
        .map(|link| link.href.clone())
        .unwrap_or_default()
}

fn categories(categories: &[feed_rs::model::Category]) -> Vec<String> {
    categories
        .iter()
        .map(|category| category.term.clone())
        .filter(|term| !term.is_empty())
        .collect()
}

/// Formats entry authors as `Name <email>`, `Name`, or `email`, skipping
/// authors with neither.
fn author_names(entry: &Entry) -> Vec<String> {
    entry
        .authors
        .iter()
        .filter_map(|person| {
            let name = person.name.trim();
            let email = person.email.as_deref().unwrap_or_default().trim();
            match (name.is_empty(), email.is_empty()) {
                (false, false) => Some(format!("{name} <{email}>")),
                (false, true) => Some(name.to_string()),
                (true, false) => Some(email.to_string()),
                (true, true) => None,
            }
        })
        .collect()
}

fn enclosures(entry: &Entry) -> Vec<String> {
    entry
        .media
        .iter()
        .flat_map(|media| media.content.iter())
        .filter_map(|content| content.url.as_ref().map(|url| url.to_string()))
        .collect()
}

/// The entry's image URL: the first media thumbnail, if any.
fn thumbnail(entry: &Entry) -> String {
    entry
        .media
        .iter()
        .flat_map(|media| media.thumbnails.iter())
        .map(|thumbnail| thumbnail.image.uri.clone())
        .next()
        .unwrap_or_default()
}

fn feed_type_version(feed_type: &FeedType) -> (&'static str, &'static str) {
    match feed_type {
        FeedType::Atom => ("atom", "1.0"),
        FeedType::RSS0 => ("rss", "0.9"),
        FeedType::RSS1 => ("rss", "1.0"),
        FeedType::RSS2 => ("rss", "2.0"),
        FeedType::JSON => ("json", ""),
    }
}
