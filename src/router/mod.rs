//! The message router: binds topics to handlers and runs them to completion.
//!
//! A handler registration names an input topic consumed through a
//! [`Subscriber`] and an output topic produced through a [`Publisher`]; the
//! handler function maps each incoming message to zero or more outgoing
//! messages. Every registration runs in its own task. Around each handler
//! the router composes the middleware stack: correlation-id propagation,
//! retry with backoff, panic recovery, and an optional per-handler type
//! filter.
//!
//! [`Router::run`] blocks until the router is closed -- by the signals
//! plugin on SIGINT/SIGTERM, or by any [`CloseHandle`] -- then drains
//! in-flight handlers up to the configured close timeout.

mod middleware;

pub use middleware::{
    correlation_id, handler_fn, recoverer, retry, type_filter, HandlerFn, HandlerResult,
    RetryConfig, UnhandledMime,
};

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::pubsub::{Message, Publisher, Subscriber};

#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    /// How long to wait for in-flight handlers when closing.
    pub close_timeout: Duration,
    /// Retry policy applied to every handler.
    pub retry: RetryConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            close_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

/// One handler registration: where to consume, where to produce, and the
/// function in between.
pub struct Handler {
    name: String,
    input_topic: String,
    subscriber: Arc<dyn Subscriber>,
    output_topic: String,
    publisher: Arc<dyn Publisher>,
    func: HandlerFn,
    type_filter: Option<(String, Vec<String>)>,
}

impl Handler {
    /// Restricts this handler to messages of the given MIME type and event
    /// type names. Non-matching types are nacked and dropped silently.
    pub fn with_type_filter(&mut self, mime: &str, types: &[&str]) -> &mut Self {
        self.type_filter = Some((
            mime.to_string(),
            types.iter().map(|t| t.to_string()).collect(),
        ));
        self
    }
}

/// A plugin runs once when the router starts, before the running signal
/// flips; use it to launch background work tied to the router lifecycle.
pub type Plugin = Box<dyn FnOnce(&Router) -> anyhow::Result<()> + Send>;

/// Closes the router from anywhere.
#[derive(Clone)]
pub struct CloseHandle {
    closing: Arc<watch::Sender<bool>>,
}

impl CloseHandle {
    pub fn close(&self) {
        self.closing.send_replace(true);
    }
}

pub struct Router {
    config: RouterConfig,
    handlers: Vec<Handler>,
    plugins: Vec<Plugin>,
    running: Arc<watch::Sender<bool>>,
    closing: Arc<watch::Sender<bool>>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        let (running, _) = watch::channel(false);
        let (closing, _) = watch::channel(false);
        Router {
            config,
            handlers: Vec::new(),
            plugins: Vec::new(),
            running: Arc::new(running),
            closing: Arc::new(closing),
        }
    }

    /// Registers a handler consuming `input_topic` and producing to
    /// `output_topic`.
    ///
    /// # Arguments
    ///
    /// * `name` - Handler name used in logs
    /// * `input_topic` - Topic consumed through `subscriber`
    /// * `subscriber` - Broker side delivering incoming messages
    /// * `output_topic` - Topic the handler's output is published to
    /// * `publisher` - Broker side carrying produced messages
    /// * `func` - The handler function itself
    ///
    /// # Returns
    ///
    /// The registration, for further configuration such as
    /// [`Handler::with_type_filter`].
    pub fn add_handler(
        &mut self,
        name: impl Into<String>,
        input_topic: impl Into<String>,
        subscriber: Arc<dyn Subscriber>,
        output_topic: impl Into<String>,
        publisher: Arc<dyn Publisher>,
        func: HandlerFn,
    ) -> &mut Handler {
        self.handlers.push(Handler {
            name: name.into(),
            input_topic: input_topic.into(),
            subscriber,
            output_topic: output_topic.into(),
            publisher,
            func,
            type_filter: None,
        });
        self.handlers.last_mut().expect("just pushed")
    }

    pub fn add_plugin(&mut self, plugin: Plugin) {
        self.plugins.push(plugin);
    }

    /// A receiver that flips to true once all handlers are consuming.
    pub fn running_signal(&self) -> watch::Receiver<bool> {
        self.running.subscribe()
    }

    /// A receiver that flips to true when shutdown begins.
    pub fn closing_signal(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            closing: Arc::clone(&self.closing),
        }
    }

    /// Runs the router until it is closed, then drains in-flight handlers
    /// up to the close timeout.
    ///
    /// # Errors
    ///
    /// Fails during startup when a handler cannot subscribe to its input
    /// topic or a plugin returns an error; a clean close is not an error.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut tasks = JoinSet::new();

        for handler in std::mem::take(&mut self.handlers) {
            let mut stream = handler
                .subscriber
                .subscribe(&handler.input_topic)
                .await
                .map_err(|err| {
                    anyhow::anyhow!("could not subscribe {} to {}: {err}", handler.name, handler.input_topic)
                })?;

            // Compose the middleware stack around the business handler. The
            // retry wraps the recoverer so a panic converted to an error
            // re-enters the retry path; the type filter sits outside both so
            // foreign message types never spend retry budget.
            let mut func = middleware::retry(self.config.retry, middleware::recoverer(handler.func));
            if let Some((mime, types)) = &handler.type_filter {
                let types: Vec<&str> = types.iter().map(String::as_str).collect();
                func = middleware::type_filter(mime, &types, func);
            }
            let func = middleware::correlation_id(func);

            let name = handler.name;
            let publisher = handler.publisher;
            let output_topic = handler.output_topic;
            let mut closing = self.closing.subscribe();

            tasks.spawn(async move {
                tracing::debug!(handler = %name, "handler consuming");
                loop {
                    tokio::select! {
                        _ = wait_until_closed(&mut closing) => break,
                        next = stream.next() => match next {
                            None => break,
                            Some(msg) => dispatch(&name, &func, publisher.as_ref(), &output_topic, msg).await,
                        }
                    }
                }
                tracing::debug!(handler = %name, "handler stopped");
            });
        }

        for plugin in std::mem::take(&mut self.plugins) {
            plugin(&self)?;
        }

        self.running.send_replace(true);
        tracing::info!(handlers = tasks.len(), "router is running");

        let mut closing = self.closing.subscribe();
        let _ = closing.wait_for(|closed| *closed).await;
        tracing::info!("router closing, draining handlers");

        let drained = tokio::time::timeout(self.config.close_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                timeout = ?self.config.close_timeout,
                "close timeout exceeded, aborting in-flight handlers"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        tracing::info!("router stopped");
        Ok(())
    }
}

/// Awaits a closing signal without holding the watch `Ref` guard across
/// other `.await` points in the caller (it is not `Send`).
async fn wait_until_closed(closing: &mut watch::Receiver<bool>) {
    let _ = closing.wait_for(|closed| *closed).await;
}

async fn dispatch(
    name: &str,
    func: &HandlerFn,
    publisher: &dyn Publisher,
    output_topic: &str,
    msg: Message,
) {
    match func(msg.clone()).await {
        Ok(produced) => {
            if !produced.is_empty() {
                if let Err(err) = publisher.publish(output_topic, produced).await {
                    tracing::error!(
                        handler = %name,
                        uuid = %msg.uuid,
                        topic = output_topic,
                        err = %err,
                        "could not publish handler output"
                    );
                    msg.nack();
                    return;
                }
            }
            // A no-op if a middleware (e.g. the type filter) already settled it.
            msg.ack();
        }
        Err(err) => {
            tracing::error!(handler = %name, uuid = %msg.uuid, err = ?err, "handler failed");
            msg.nack();
        }
    }
}

/// Gracefully closes the router when the process receives SIGINT or SIGTERM.
pub fn signals_handler(router: &Router) -> anyhow::Result<()> {
    let close = router.close_handle();
    tokio::spawn(async move {
        let interrupted = wait_for_signal().await;
        tracing::info!(signal = interrupted, "shutdown signal received, closing router");
        close.close();
    });
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            tracing::error!(err = %err, "could not install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}
