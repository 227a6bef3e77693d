//! The post fetch handler: derives Document events from feed items.
//!
//! Every FeedItem with a link becomes exactly one Document on the documents
//! topic. An HTTP failure is part of the story downstream consumers want to
//! hear, so the Document is emitted anyway with `active` false and the
//! status recorded; only transport, decode, and codec failures surface to
//! the router's retry path.

use chrono::Utc;
use std::sync::Arc;

use crate::config::Config;
use crate::events::{self, Event, FeedItem};
use crate::fetch::HtmlFetcher;
use crate::metrics;
use crate::pubsub::Message;
use crate::router::{handler_fn, HandlerFn, HandlerResult};

#[derive(Debug)]
pub struct PostFetch {
    client: reqwest::Client,
}

impl PostFetch {
    /// Creates the post fetch service.
    ///
    /// # Errors
    ///
    /// Fails when post fetch is not enabled in the configuration.
    pub fn new(conf: &Config, client: reqwest::Client) -> anyhow::Result<Self> {
        anyhow::ensure!(conf.post_fetch_enabled, "post fetch is not enabled");
        Ok(PostFetch { client })
    }

    /// The router handler function for feed item events.
    pub fn handler(self: &Arc<Self>) -> HandlerFn {
        let posts = Arc::clone(self);
        handler_fn(move |msg| {
            let posts = Arc::clone(&posts);
            async move { posts.handle(msg).await }
        })
    }

    /// Handles one FeedItem event. Items without a link are dropped
    /// silently.
    ///
    /// # Returns
    ///
    /// Exactly one Document event, inactive with the status recorded when
    /// the article fetch failed with an HTTP error; empty for a link-less
    /// item.
    ///
    /// # Errors
    ///
    /// Codec errors on the incoming message, transport failures, and
    /// decode failures surface to the router's retry path instead of
    /// producing a Document.
    pub async fn handle(&self, msg: Message) -> HandlerResult {
        let event = FeedItem::from_message(&msg)?;
        if event.link.is_empty() {
            return Ok(Vec::new());
        }

        tracing::info!(feed_id = %event.feed_id, url = %event.link, "fetching post");

        let mut doc = events::Document {
            fetched_at: Utc::now(),
            active: true,
            feed_id: event.feed_id.clone(),
            ..events::Document::default()
        };

        let fetcher = HtmlFetcher::new(self.client.clone(), &event.link);
        match fetcher.fetch().await {
            Ok(html) => {
                doc.content = html.extract().map_err(|err| {
                    tracing::warn!(
                        url = %event.link,
                        feed_id = %event.feed_id,
                        err = %err,
                        "could not decode post"
                    );
                    err
                })?;
                doc.title = html.title().to_string();
                doc.description = html.description().to_string();
            }
            Err(err) if err.is_http() => {
                tracing::warn!(
                    url = %event.link,
                    feed_id = %event.feed_id,
                    status_code = err.status_code().unwrap_or_default(),
                    err = %err,
                    "could not fetch post"
                );
                doc.active = false;
                doc.status_code = err.status_code().unwrap_or_default();
                doc.error = err.status_line().unwrap_or_default().to_string();
            }
            Err(err) => {
                tracing::warn!(
                    url = %event.link,
                    feed_id = %event.feed_id,
                    err = %err,
                    "could not fetch post"
                );
                return Err(err.into());
            }
        }

        doc.link = event.link.clone();
        metrics::document_recorded(if doc.active { 200 } else { doc.status_code });

        Ok(vec![events::marshal(&Event::Document(doc))?])
    }
}
