//! The Baleen service: a router configured with the ingestion handlers.
//!
//! Wires the topology together according to configuration: subscription
//! events feed the [`FeedSync`] handler, whose output feeds the
//! [`PostFetch`] handler, whose output lands on the documents topic.
//! Calling [`Baleen::run`] starts the metrics server and blocks on the
//! router until shutdown.

use std::sync::Arc;

use crate::config::{Config, ConfigError};
use crate::events;
use crate::fetch;
use crate::metrics;
use crate::posts::PostFetch;
use crate::pubsub::{
    MemoryBroker, Publisher, Subscriber, TOPIC_DOCUMENTS, TOPIC_FEEDS, TOPIC_SUBSCRIPTIONS,
};
use crate::router::{signals_handler, RetryConfig, Router, RouterConfig};
use crate::sync::FeedSync;

/// Builds the broker connection described by the configuration.
///
/// With empty endpoints both sides resolve to one shared in-process broker,
/// which makes a single-process deployment (and every test) work without
/// external infrastructure.
///
/// # Errors
///
/// - [`ConfigError::NoBroker`] - Publisher or subscriber disabled
/// - [`ConfigError::UnsupportedBroker`] - A remote endpoint is configured;
///   rejected until a broker transport is wired in
pub fn connect_broker(conf: &Config) -> Result<(Arc<dyn Publisher>, Arc<dyn Subscriber>), ConfigError> {
    if !conf.publisher_enabled || !conf.subscriber_enabled {
        return Err(ConfigError::NoBroker);
    }
    if !conf.publisher_endpoint.is_empty() || !conf.subscriber_endpoint.is_empty() {
        return Err(ConfigError::UnsupportedBroker);
    }

    let broker = Arc::new(MemoryBroker::new());
    Ok((broker.clone(), broker))
}

pub struct Baleen {
    conf: Config,
    router: Router,
    fsync: Option<Arc<FeedSync>>,
}

impl Baleen {
    /// Assembles the service from configuration: broker connection, router,
    /// middleware, and whichever handlers are enabled.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration (see [`Config::validate`]) or when
    /// the HTTP client cannot be built.
    pub fn new(conf: Config) -> anyhow::Result<Self> {
        conf.validate()?;
        let (publisher, subscriber) = connect_broker(&conf)?;
        Baleen::with_broker(conf, publisher, subscriber)
    }

    /// Assembles the service against an explicit broker connection. Used by
    /// [`Baleen::new`] and directly by tests that need to publish and
    /// subscribe around the service.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be built or an enabled handler
    /// rejects its configuration.
    pub fn with_broker(
        conf: Config,
        publisher: Arc<dyn Publisher>,
        subscriber: Arc<dyn Subscriber>,
    ) -> anyhow::Result<Self> {
        let client = fetch::default_client()?;

        let mut router = Router::new(RouterConfig {
            close_timeout: conf.close_timeout,
            retry: RetryConfig {
                max_retries: conf.max_retries,
                ..RetryConfig::default()
            },
        });
        router.add_plugin(Box::new(signals_handler));

        let mut fsync = None;
        if conf.feed_sync_enabled {
            let service = Arc::new(FeedSync::new(&conf, client.clone(), publisher.clone())?);

            router
                .add_handler(
                    "feed_sync",
                    TOPIC_SUBSCRIPTIONS,
                    subscriber.clone(),
                    TOPIC_FEEDS,
                    publisher.clone(),
                    service.handler(),
                )
                .with_type_filter(events::MIME_MSGPACK, &[events::TYPE_SUBSCRIPTION]);

            // Start the sync interval when the router begins running.
            let starter = Arc::clone(&service);
            router.add_plugin(Box::new(move |router| starter.start(router)));
            fsync = Some(service);
        }

        if conf.post_fetch_enabled {
            let service = Arc::new(PostFetch::new(&conf, client)?);

            router
                .add_handler(
                    "post_fetch",
                    TOPIC_FEEDS,
                    subscriber.clone(),
                    TOPIC_DOCUMENTS,
                    publisher.clone(),
                    service.handler(),
                )
                .with_type_filter(events::MIME_MSGPACK, &[events::TYPE_FEED_ITEM]);
        }

        Ok(Baleen {
            conf,
            router,
            fsync,
        })
    }

    /// A handle that gracefully closes the running service.
    pub fn close_handle(&self) -> crate::router::CloseHandle {
        self.router.close_handle()
    }

    /// A receiver that flips to true once the router is consuming.
    pub fn running_signal(&self) -> tokio::sync::watch::Receiver<bool> {
        self.router.running_signal()
    }

    /// Runs the service until shutdown: serves metrics, runs the router to
    /// completion, then stops the sync loop and the metrics server.
    ///
    /// # Errors
    ///
    /// Fails when the metrics server cannot bind or the router fails to
    /// start (see [`Router::run`](crate::router::Router::run)).
    pub async fn run(self) -> anyhow::Result<()> {
        let metrics_server = metrics::serve(&self.conf).await?;

        let result = self.router.run().await;

        if let Some(fsync) = &self.fsync {
            fsync.stop();
        }
        if let Some(server) = metrics_server {
            server.shutdown().await;
        }
        result
    }
}
