//! Prometheus collectors and the monitoring endpoint.
//!
//! Collectors live in a process-wide registry initialized on first use, so
//! handlers can record outcomes whether or not the scrape server is
//! enabled. [`serve`] binds the `/metrics` endpoint when monitoring is
//! enabled and returns a handle for graceful shutdown.

use axum::routing::get;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;

const NAMESPACE: &str = "baleen";

pub struct Collectors {
    /// Number of feeds currently tracked by the manifest
    pub subscriptions: IntGauge,
    /// Feed synchronization attempts by response status
    pub feed_syncs: IntCounterVec,
    /// Feed items discovered across all syncs, by feed
    pub feed_items: IntCounterVec,
    /// Documents fetched by response status
    pub documents: IntCounterVec,
    registry: Registry,
}

static COLLECTORS: OnceLock<Collectors> = OnceLock::new();

/// The process-wide collectors, registering them on first use.
pub fn collectors() -> &'static Collectors {
    COLLECTORS.get_or_init(Collectors::register)
}

impl Collectors {
    fn register() -> Self {
        let registry = Registry::new();

        let subscriptions = IntGauge::with_opts(
            Opts::new(
                "subscriptions",
                "the number of subscriptions currently handled by the node",
            )
            .namespace(NAMESPACE),
        )
        .expect("subscriptions gauge options are static");

        let feed_syncs = IntCounterVec::new(
            Opts::new("feed_syncs", "the number of times a feed sync has occurred")
                .namespace(NAMESPACE),
            &["status_code"],
        )
        .expect("feed_syncs counter options are static");

        let feed_items = IntCounterVec::new(
            Opts::new(
                "feed_items",
                "the number of feed items discovered across all feed syncs",
            )
            .namespace(NAMESPACE),
            &["feed_id"],
        )
        .expect("feed_items counter options are static");

        let documents = IntCounterVec::new(
            Opts::new("documents", "the number of documents fetched").namespace(NAMESPACE),
            &["status_code"],
        )
        .expect("documents counter options are static");

        for collector in [
            Box::new(subscriptions.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(feed_syncs.clone()),
            Box::new(feed_items.clone()),
            Box::new(documents.clone()),
        ] {
            registry
                .register(collector)
                .expect("collectors register exactly once");
        }

        Collectors {
            subscriptions,
            feed_syncs,
            feed_items,
            documents,
            registry,
        }
    }

    /// Renders all collectors in the Prometheus text exposition format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!(err = %err, "could not encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Records the outcome of one feed synchronization attempt.
pub fn feed_sync_recorded(status_code: u16) {
    collectors()
        .feed_syncs
        .with_label_values(&[&status_code.to_string()])
        .inc();
}

/// Records items discovered by a successful sync.
pub fn feed_items_recorded(feed_id: &str, count: u64) {
    collectors()
        .feed_items
        .with_label_values(&[feed_id])
        .inc_by(count);
}

/// Records the outcome of one document fetch.
pub fn document_recorded(status_code: u16) {
    collectors()
        .documents
        .with_label_values(&[&status_code.to_string()])
        .inc();
}

/// Updates the tracked-subscription gauge to the manifest size.
pub fn subscriptions_set(count: i64) {
    collectors().subscriptions.set(count);
}

/// A running metrics server; dropping it leaks the task, call
/// [`shutdown`](MetricsServer::shutdown) instead.
pub struct MetricsServer {
    shutdown: Arc<watch::Sender<bool>>,
    task: JoinHandle<()>,
}

impl MetricsServer {
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(err) = self.task.await {
            tracing::warn!(err = %err, "metrics server task failed");
        }
    }
}

/// Starts the `/metrics` server when monitoring is enabled.
///
/// # Returns
///
/// A shutdown handle for the running server, or `None` when monitoring is
/// disabled.
///
/// # Errors
///
/// Fails when the listen address cannot be bound.
pub async fn serve(conf: &Config) -> anyhow::Result<Option<MetricsServer>> {
    if !conf.monitoring_enabled {
        return Ok(None);
    }

    let addr = conf.monitoring_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let app = axum::Router::new().route("/metrics", get(|| async { collectors().gather() }));

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|stopped| *stopped).await;
        });
        if let Err(err) = server.await {
            tracing::error!(err = %err, "metrics server shutdown prematurely");
        }
    });

    tracing::info!(addr = %format!("http://{addr}/metrics"), "metrics server started and ready for prometheus collector");
    Ok(Some(MetricsServer {
        shutdown: Arc::new(shutdown_tx),
        task,
    }))
}
