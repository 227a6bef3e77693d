use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::pubsub::{meta, Message};

/// The output of a handler invocation: zero or more messages to produce on
/// the handler's output topic.
pub type HandlerResult = anyhow::Result<Vec<Message>>;

/// A message handler. Middleware are functions from `HandlerFn` to
/// `HandlerFn`, composed outside-in around the innermost business handler.
pub type HandlerFn = Arc<dyn Fn(Message) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wraps an async closure as a [`HandlerFn`].
pub fn handler_fn<F, Fut>(func: F) -> HandlerFn
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |msg| func(msg).boxed())
}

/// Returned when a message's MIME metadata does not match the handler's
/// codec; enters the retry path rather than being silently dropped.
#[derive(Debug, Error)]
#[error("message mimetype is not handled")]
pub struct UnhandledMime;

/// Copies the correlation id from the incoming message onto every produced
/// message, minting a fresh one when the incoming message has none, so a
/// causal chain of messages can be followed across topics.
pub fn correlation_id(next: HandlerFn) -> HandlerFn {
    Arc::new(move |msg: Message| {
        let next = Arc::clone(&next);
        async move {
            let correlation = match msg.metadata.get(meta::CORRELATION_ID) {
                "" => Uuid::now_v7().to_string(),
                id => id.to_string(),
            };
            let mut produced = next(msg).await?;
            for out in &mut produced {
                out.metadata.set(meta::CORRELATION_ID, correlation.as_str());
            }
            Ok(produced)
        }
        .boxed()
    })
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Additional invocations after the first failure. Zero defers all
    /// redelivery to the broker.
    pub max_retries: u32,
    /// Backoff before the first retry; doubles on each subsequent one.
    pub initial_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 0,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

/// Re-invokes the handler on error up to `max_retries` times with doubling
/// backoff. The exhausted error propagates to the router, which nacks the
/// message and leaves redelivery to the broker.
///
/// # Arguments
///
/// * `config` - Retry count and initial backoff
/// * `next` - The handler to wrap
pub fn retry(config: RetryConfig, next: HandlerFn) -> HandlerFn {
    Arc::new(move |msg: Message| {
        let next = Arc::clone(&next);
        async move {
            let mut backoff = config.initial_backoff;
            let mut attempt = 0u32;
            loop {
                match next(msg.clone()).await {
                    Ok(produced) => return Ok(produced),
                    Err(err) => {
                        if attempt >= config.max_retries {
                            return Err(err);
                        }
                        attempt += 1;
                        tracing::warn!(
                            uuid = %msg.uuid,
                            attempt,
                            max_retries = config.max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            err = %err,
                            "handler failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        .boxed()
    })
}

/// Converts handler panics into errors so they enter the retry path instead
/// of tearing down the handler task.
pub fn recoverer(next: HandlerFn) -> HandlerFn {
    Arc::new(move |msg: Message| {
        let next = Arc::clone(&next);
        async move {
            match AssertUnwindSafe(next(msg)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(anyhow::anyhow!("handler panicked: {}", panic_message(&panic))),
            }
        }
        .boxed()
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Accepts only messages whose `type_name` metadata is in the given set and
/// whose `mime` matches the handler's codec. A message of the wrong type is
/// nacked and dropped without error -- other handlers own it; a matching
/// type with the wrong MIME is a real fault and returns [`UnhandledMime`].
///
/// # Arguments
///
/// * `mime` - The codec MIME type this handler understands
/// * `types` - Accepted event type names
/// * `next` - The handler to wrap
pub fn type_filter(mime: &str, types: &[&str], next: HandlerFn) -> HandlerFn {
    let mime = mime.to_string();
    let accepted: HashSet<String> = types.iter().map(|t| t.to_string()).collect();

    Arc::new(move |msg: Message| {
        let next = Arc::clone(&next);
        let mime = mime.clone();
        let accepted = accepted.clone();
        async move {
            if !accepted.contains(msg.metadata.get(meta::TYPE_NAME)) {
                tracing::debug!(
                    uuid = %msg.uuid,
                    type_name = msg.metadata.get(meta::TYPE_NAME),
                    "dropping message of unhandled type"
                );
                msg.nack();
                return Ok(Vec::new());
            }
            if msg.metadata.get(meta::MIME) != mime {
                return Err(UnhandledMime.into());
            }
            next(msg).await
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::Receipt;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn produce_one() -> HandlerFn {
        handler_fn(|_msg| async { Ok(vec![Message::new("out", Vec::new())]) })
    }

    #[tokio::test]
    async fn test_correlation_id_is_copied() {
        let handler = correlation_id(produce_one());

        let mut msg = Message::new("in", Vec::new());
        msg.metadata.set(meta::CORRELATION_ID, "chain-1");

        let produced = handler(msg).await.unwrap();
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].metadata.get(meta::CORRELATION_ID), "chain-1");
    }

    #[tokio::test]
    async fn test_correlation_id_minted_when_missing() {
        let handler = correlation_id(produce_one());
        let produced = handler(Message::new("in", Vec::new())).await.unwrap();
        assert!(!produced[0].metadata.get(meta::CORRELATION_ID).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget() {
        let invocations = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&invocations);
        let failing = handler_fn(move |_msg| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("deterministic failure"))
            }
        });

        let handler = retry(
            RetryConfig {
                max_retries: 3,
                initial_backoff: Duration::from_millis(100),
            },
            failing,
        );

        let err = handler(Message::new("in", Vec::new())).await.unwrap_err();
        assert_eq!(err.to_string(), "deterministic failure");
        assert_eq!(invocations.load(Ordering::SeqCst), 4, "1 initial + 3 retries");
    }

    #[tokio::test]
    async fn test_retry_zero_fails_fast() {
        let invocations = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&invocations);
        let failing = handler_fn(move |_msg| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("nope"))
            }
        });

        let handler = retry(RetryConfig::default(), failing);
        handler(Message::new("in", Vec::new())).await.unwrap_err();
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_after_transient_failure() {
        let invocations = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&invocations);
        let flaky = handler_fn(move |_msg| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(anyhow::anyhow!("transient"))
                } else {
                    Ok(Vec::new())
                }
            }
        });

        let handler = retry(
            RetryConfig {
                max_retries: 3,
                initial_backoff: Duration::from_millis(100),
            },
            flaky,
        );
        handler(Message::new("in", Vec::new())).await.unwrap();
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_recoverer_converts_panic() {
        let panicking = handler_fn(|_msg| async {
            if true {
                panic!("boom");
            }
            Ok(Vec::new())
        });
        let handler = recoverer(panicking);

        let err = handler(Message::new("in", Vec::new())).await.unwrap_err();
        assert!(err.to_string().contains("boom"), "got: {err}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_panics_enter_the_retry_path() {
        let invocations = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&invocations);
        let panicking = handler_fn(move |_msg| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < u32::MAX {
                    panic!("boom");
                }
                Ok(Vec::new())
            }
        });

        let handler = retry(
            RetryConfig {
                max_retries: 2,
                initial_backoff: Duration::from_millis(100),
            },
            recoverer(panicking),
        );
        handler(Message::new("in", Vec::new())).await.unwrap_err();
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_type_filter_drops_unknown_type() {
        let handler = type_filter("application/msgpack", &["Subscription"], produce_one());

        let mut msg = Message::new("in", Vec::new());
        msg.metadata.set(meta::TYPE_NAME, "UnknownKind");
        msg.metadata.set(meta::MIME, "application/msgpack");
        let handle = msg.clone();

        let produced = handler(msg).await.unwrap();
        assert!(produced.is_empty(), "dropped message must produce nothing");
        assert_eq!(handle.receipt(), Receipt::Nacked);
    }

    #[tokio::test]
    async fn test_type_filter_rejects_wrong_mime() {
        let handler = type_filter("application/msgpack", &["Subscription"], produce_one());

        let mut msg = Message::new("in", Vec::new());
        msg.metadata.set(meta::TYPE_NAME, "Subscription");
        msg.metadata.set(meta::MIME, "application/json");

        let err = handler(msg).await.unwrap_err();
        assert!(err.downcast_ref::<UnhandledMime>().is_some());
    }

    #[tokio::test]
    async fn test_type_filter_passes_accepted_type() {
        let handler = type_filter("application/msgpack", &["Subscription"], produce_one());

        let mut msg = Message::new("in", Vec::new());
        msg.metadata.set(meta::TYPE_NAME, "Subscription");
        msg.metadata.set(meta::MIME, "application/msgpack");

        let produced = handler(msg).await.unwrap();
        assert_eq!(produced.len(), 1);
    }
}
