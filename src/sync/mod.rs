//! Feed synchronization: the manifest of live subscriptions and the
//! handler/tick loop that drives it.
//!
//! Subscription events arriving on the subscriptions topic are added to the
//! [`Manifest`] and synchronized immediately; a background task re-syncs
//! every tracked feed on the configured interval. Either path produces the
//! same ordered batch per feed -- one FeedSync event followed by the
//! FeedItem events of that sync -- published to the feeds topic. A failure
//! in one feed never stops the others.

mod manifest;

pub use manifest::{Feed, Manifest};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::Config;
use crate::events::Subscription;
use crate::metrics;
use crate::pubsub::{meta, Message, Publisher, TOPIC_FEEDS};
use crate::router::{handler_fn, HandlerFn, HandlerResult, Router};

/// The feed synchronization service: reacts to subscription events and runs
/// the periodic sync loop once the router is running.
pub struct FeedSync {
    interval: Duration,
    manifest: Arc<Manifest>,
    publisher: Arc<dyn Publisher>,
    stop: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for FeedSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSync")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl FeedSync {
    /// Creates the feed sync service with an empty manifest.
    ///
    /// # Arguments
    ///
    /// * `conf` - Service configuration (interval, enablement)
    /// * `client` - HTTP client handed to each feed's fetcher
    /// * `publisher` - Where the tick loop publishes feed batches
    ///
    /// # Errors
    ///
    /// Fails when feed sync is not enabled in the configuration.
    pub fn new(
        conf: &Config,
        client: reqwest::Client,
        publisher: Arc<dyn Publisher>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(conf.feed_sync_enabled, "feed sync is not enabled");

        let (stop, _) = watch::channel(false);
        Ok(FeedSync {
            interval: conf.feed_sync_interval,
            manifest: Arc::new(Manifest::new(client)),
            publisher,
            stop: Arc::new(stop),
        })
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    /// The router handler function for subscription events.
    pub fn handler(self: &Arc<Self>) -> HandlerFn {
        let fsync = Arc::clone(self);
        handler_fn(move |msg| {
            let fsync = Arc::clone(&fsync);
            async move { fsync.handle(msg).await }
        })
    }

    /// Handles one Subscription event: adds (or merges) the feed into the
    /// manifest and synchronizes it right away. Subscriptions without a
    /// feed URL are dropped silently.
    ///
    /// # Returns
    ///
    /// The sync's batch for the feeds topic, empty for a URL-less
    /// subscription.
    ///
    /// # Errors
    ///
    /// Codec errors on the incoming message and non-HTTP sync failures
    /// (see [`Feed::sync`]) surface to the router's retry path.
    pub async fn handle(&self, msg: Message) -> HandlerResult {
        let info = Subscription::from_message(&msg)?;
        if info.feed_url.is_empty() {
            return Ok(Vec::new());
        }

        let feed = self.manifest.add(info).await;
        let mut feed = feed.lock().await;
        feed.sync().await
    }

    /// Starts the background sync loop. Called by the router as a plugin
    /// when it begins running; the task waits for the running signal, then
    /// synchronizes every manifest feed on each tick until the stop channel
    /// or the router's own shutdown closes it.
    ///
    /// # Errors
    ///
    /// Fails (and thereby fails router startup) when the configured
    /// interval is shorter than one second.
    pub fn start(&self, router: &Router) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.interval >= Duration::from_secs(1),
            "feed sync interval must be 1s or greater"
        );

        let mut running = router.running_signal();
        let mut closing = router.closing_signal();
        let mut stop = self.stop.subscribe();
        let manifest = Arc::clone(&self.manifest);
        let publisher = Arc::clone(&self.publisher);
        let interval = self.interval;

        tokio::spawn(async move {
            if running.wait_for(|r| *r).await.is_err() {
                return;
            }
            tracing::info!(interval = ?interval, "feed sync interval is running");

            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);

            loop {
                tokio::select! {
                    _ = stop.wait_for(|stopped| *stopped) => break,
                    _ = closing.wait_for(|closed| *closed) => break,
                    _ = ticker.tick() => {}
                }

                let feeds = manifest.snapshot().await;
                metrics::subscriptions_set(feeds.len() as i64);
                tracing::info!(nfeeds = feeds.len(), "synchronizing feeds");

                for feed in feeds {
                    let mut feed = feed.lock().await;
                    let (feed_id, url) = {
                        let info = feed.info();
                        (info.feed_id.clone(), info.feed_url.clone())
                    };

                    let mut msgs = match feed.sync().await {
                        Ok(msgs) => msgs,
                        Err(err) => {
                            tracing::error!(
                                feed_id = %feed_id,
                                url = %url,
                                err = ?err,
                                "could not synchronize feed"
                            );
                            continue;
                        }
                    };

                    // Tick-originated messages start a fresh causal chain.
                    let correlation = Uuid::now_v7().to_string();
                    for msg in &mut msgs {
                        msg.metadata.set(meta::CORRELATION_ID, correlation.as_str());
                    }

                    if let Err(err) = publisher.publish(TOPIC_FEEDS, msgs).await {
                        tracing::error!(
                            feed_id = %feed_id,
                            url = %url,
                            err = %err,
                            "could not publish feed messages"
                        );
                    }
                }
            }

            tracing::info!("feed sync interval has stopped");
        });

        Ok(())
    }

    /// Closes the stop channel, ending the background loop.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }
}
