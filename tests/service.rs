//! End-to-end tests for the assembled service: subscription events in, feed
//! and document events out, through the router, handlers, and the
//! in-process broker.
//!
//! Each test builds its own service around a shared memory broker and a
//! wiremock server, waits for the router's running signal before
//! publishing, and collects results from the output topics with a deadline.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use pretty_assertions::assert_eq;
use wiremock::matchers::{header, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

use baleen::config::Config;
use baleen::events::{self, Document, Event, FeedItem, FeedSync, Subscription};
use baleen::pubsub::{
    meta, MemoryBroker, Message, MessageStream, Publisher, Subscriber, TOPIC_DOCUMENTS,
    TOPIC_FEEDS, TOPIC_SUBSCRIPTIONS,
};
use baleen::router::CloseHandle;
use baleen::Baleen;

const POST_HTML: &[u8] = include_bytes!("testdata/post.html");

const RSS2: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<rss version="2.0">
  <channel>
    <title>Sample Feed</title>
    <link>http://example.org/</link>
    <description>For documentation only</description>
    <item>
      <title>First entry title</title>
      <link>http://example.org/entry/3</link>
      <guid>http://example.org/entry/3</guid>
      <description>Watch out for nasty tricks</description>
    </item>
  </channel>
</rss>"#;

struct Harness {
    broker: Arc<MemoryBroker>,
    close: CloseHandle,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    /// Builds and starts a service with both handlers enabled, returning
    /// once the router reports running.
    async fn start() -> Harness {
        let conf = Config {
            feed_sync_enabled: true,
            feed_sync_interval: Duration::from_secs(3600),
            post_fetch_enabled: true,
            monitoring_enabled: false,
            close_timeout: Duration::from_secs(5),
            ..Config::default()
        };

        let broker = Arc::new(MemoryBroker::new());
        let service = Baleen::with_broker(conf, broker.clone(), broker.clone()).unwrap();
        let close = service.close_handle();
        let mut running = service.running_signal();
        let task = tokio::spawn(service.run());
        running.wait_for(|r| *r).await.unwrap();

        Harness {
            broker,
            close,
            task,
        }
    }

    async fn subscribe(&self, topic: &str) -> MessageStream {
        self.broker.subscribe(topic).await.unwrap()
    }

    async fn publish(&self, topic: &str, msg: Message) {
        self.broker.publish(topic, vec![msg]).await.unwrap();
    }

    async fn shutdown(self) {
        self.close.close();
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("service stops within the close timeout")
            .unwrap()
            .unwrap();
    }
}

async fn next_message(stream: &mut MessageStream) -> Message {
    tokio::time::timeout(Duration::from_secs(10), stream.next())
        .await
        .expect("expected a message before the deadline")
        .expect("topic stream stays open")
}

async fn expect_silence(stream: &mut MessageStream) {
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        futures::poll!(stream.next()).is_pending(),
        "expected no messages on the topic"
    );
}

fn subscription_message(feed_url: &str) -> Message {
    events::marshal(&Event::Subscription(Subscription {
        feed_url: feed_url.to_string(),
        ..Subscription::default()
    }))
    .unwrap()
}

fn feed_item_message(feed_id: &str, link: &str) -> Message {
    events::marshal(&Event::FeedItem(FeedItem {
        feed_id: feed_id.to_string(),
        link: link.to_string(),
        ..FeedItem::default()
    }))
    .unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

// ============================================================================
// Subscription -> FeedSync + FeedItem
// ============================================================================

#[tokio::test]
async fn test_subscription_produces_sync_and_item() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(RSS2, "text/xml"))
        .mount(&server)
        .await;

    let harness = Harness::start().await;
    let mut feeds = harness.subscribe(TOPIC_FEEDS).await;

    let incoming = subscription_message(&format!("{}/rss", server.uri()));
    let correlation = incoming.metadata.get(meta::CORRELATION_ID).to_string();
    harness.publish(TOPIC_SUBSCRIPTIONS, incoming).await;

    let first = next_message(&mut feeds).await;
    let sync = FeedSync::from_message(&first).unwrap();
    assert!(sync.active);
    assert_eq!(sync.title, "Sample Feed");
    assert_eq!(sync.feed_items, 1);
    assert!(!sync.feed_id.is_empty(), "a fresh feed id is assigned");

    let second = next_message(&mut feeds).await;
    let item = FeedItem::from_message(&second).unwrap();
    assert_eq!(item.feed_id, sync.feed_id);
    assert_eq!(item.title, "First entry title");

    // Both outputs carry the correlation id of the incoming message (the
    // codec does not set one on the incoming message, so the router minted
    // one; both outputs must share it).
    let chain = first.metadata.get(meta::CORRELATION_ID);
    assert!(!chain.is_empty());
    assert_eq!(second.metadata.get(meta::CORRELATION_ID), chain);
    if !correlation.is_empty() {
        assert_eq!(chain, correlation);
    }

    harness.shutdown().await;
}

// ============================================================================
// 304 Not Modified
// ============================================================================

#[tokio::test]
async fn test_second_sync_not_modified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("If-None-Match", "ABCDEFG"))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(RSS2, "text/xml")
                .insert_header("ETag", "ABCDEFG"),
        )
        .mount(&server)
        .await;

    let harness = Harness::start().await;
    let mut feeds = harness.subscribe(TOPIC_FEEDS).await;

    let url = format!("{}/rss", server.uri());
    harness.publish(TOPIC_SUBSCRIPTIONS, subscription_message(&url)).await;

    let sync = FeedSync::from_message(&next_message(&mut feeds).await).unwrap();
    assert!(sync.active);
    assert_eq!(sync.etag, "ABCDEFG");
    next_message(&mut feeds).await; // the single feed item

    // The next poll of the same feed answers 304: one inactive FeedSync.
    harness.publish(TOPIC_SUBSCRIPTIONS, subscription_message(&url)).await;
    let sync = FeedSync::from_message(&next_message(&mut feeds).await).unwrap();
    assert!(!sync.active);
    assert_eq!(sync.status_code, 304);
    expect_silence(&mut feeds).await;

    harness.shutdown().await;
}

// ============================================================================
// HTTP errors
// ============================================================================

#[tokio::test]
async fn test_forbidden_feed_produces_inactive_sync() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let harness = Harness::start().await;
    let mut feeds = harness.subscribe(TOPIC_FEEDS).await;

    harness
        .publish(
            TOPIC_SUBSCRIPTIONS,
            subscription_message(&format!("{}/forbidden", server.uri())),
        )
        .await;

    let sync = FeedSync::from_message(&next_message(&mut feeds).await).unwrap();
    assert!(!sync.active);
    assert_eq!(sync.status_code, 403);
    assert_eq!(sync.error, "403 Forbidden");
    expect_silence(&mut feeds).await;

    harness.shutdown().await;
}

// ============================================================================
// FeedItem -> Document
// ============================================================================

#[tokio::test]
async fn test_feed_item_produces_document() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(gzip(POST_HTML), "text/html")
                .insert_header("Content-Encoding", "gzip"),
        )
        .mount(&server)
        .await;

    let harness = Harness::start().await;
    let mut documents = harness.subscribe(TOPIC_DOCUMENTS).await;

    let link = format!("{}/post", server.uri());
    harness
        .publish(TOPIC_FEEDS, feed_item_message("f1", &link))
        .await;

    let msg = next_message(&mut documents).await;
    let doc = Document::from_message(&msg).unwrap();
    assert!(doc.active);
    assert_eq!(doc.status_code, 0, "status code stays unset on success");
    assert_eq!(doc.feed_id, "f1");
    assert_eq!(doc.title, "Hello World Post");
    assert_eq!(doc.description, "Just a quick test post");
    assert_eq!(doc.content.len(), 1048);
    assert_eq!(doc.link, link);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_document_emitted_on_article_http_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let harness = Harness::start().await;
    let mut documents = harness.subscribe(TOPIC_DOCUMENTS).await;

    let link = format!("{}/post", server.uri());
    harness
        .publish(TOPIC_FEEDS, feed_item_message("f1", &link))
        .await;

    let doc = Document::from_message(&next_message(&mut documents).await).unwrap();
    assert!(!doc.active);
    assert_eq!(doc.status_code, 404);
    assert_eq!(doc.error, "404 Not Found");

    harness.shutdown().await;
}

// ============================================================================
// Silent drops
// ============================================================================

#[tokio::test]
async fn test_feed_item_without_link_is_dropped() {
    let harness = Harness::start().await;
    let mut documents = harness.subscribe(TOPIC_DOCUMENTS).await;

    harness
        .publish(TOPIC_FEEDS, feed_item_message("f1", ""))
        .await;
    expect_silence(&mut documents).await;

    harness.shutdown().await;
}

#[tokio::test]
async fn test_subscription_without_url_is_dropped() {
    let harness = Harness::start().await;
    let mut feeds = harness.subscribe(TOPIC_FEEDS).await;

    harness
        .publish(TOPIC_SUBSCRIPTIONS, subscription_message(""))
        .await;
    expect_silence(&mut feeds).await;

    harness.shutdown().await;
}

#[tokio::test]
async fn test_unknown_event_type_is_dropped() {
    let harness = Harness::start().await;
    let mut feeds = harness.subscribe(TOPIC_FEEDS).await;

    let mut msg = Message::new("m1", vec![1, 2, 3]);
    msg.metadata.set(meta::TYPE_NAME, "UnknownKind");
    msg.metadata.set(meta::MIME, events::MIME_MSGPACK);
    harness.publish(TOPIC_SUBSCRIPTIONS, msg).await;

    expect_silence(&mut feeds).await;

    harness.shutdown().await;
}

// ============================================================================
// Cross-handler chain
// ============================================================================

#[tokio::test]
async fn test_subscription_flows_through_to_document() {
    let server = MockServer::start().await;

    // The feed's single item links back to this same server's post page.
    Mock::given(method("GET"))
        .and(wiremock::matchers::path("/post"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(POST_HTML, "text/html"))
        .mount(&server)
        .await;

    let rss = format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<rss version="2.0">
  <channel>
    <title>Chained Feed</title>
    <link>{0}</link>
    <description>chain test</description>
    <item>
      <title>The post</title>
      <link>{0}/post</link>
      <guid>{0}/post</guid>
    </item>
  </channel>
</rss>"#,
        server.uri()
    );
    Mock::given(method("GET"))
        .and(wiremock::matchers::path("/rss"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(rss, "text/xml"))
        .mount(&server)
        .await;

    let harness = Harness::start().await;
    let mut documents = harness.subscribe(TOPIC_DOCUMENTS).await;

    harness
        .publish(
            TOPIC_SUBSCRIPTIONS,
            subscription_message(&format!("{}/rss", server.uri())),
        )
        .await;

    let doc = Document::from_message(&next_message(&mut documents).await).unwrap();
    assert!(doc.active);
    assert_eq!(doc.title, "Hello World Post");
    assert_eq!(doc.link, format!("{}/post", server.uri()));

    harness.shutdown().await;
}
