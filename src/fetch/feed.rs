use feed_rs::model::Feed;
use reqwest::header;

use super::{decode_body, headers, FetchError, FETCH_TIMEOUT};

/// A stateful retriever for a single RSS or Atom feed URL.
///
/// The fetcher remembers the `ETag` and `Last-Modified` values from the last
/// successful response and replays them as `If-None-Match` and
/// `If-Modified-Since` on the next request, so an unchanged feed costs a
/// single 304 round trip instead of a full download. We avoid the parser's
/// own URL helpers because they do not respect etags or cache control, which
/// are necessary for continuous operation.
///
/// A `FeedFetcher` is owned by exactly one feed in the manifest and `fetch`
/// takes `&mut self`, so concurrent fetches through one fetcher are ruled
/// out at compile time rather than by a locking convention.
pub struct FeedFetcher {
    client: reqwest::Client,
    url: String,
    etag: String,
    modified: String,
}

impl FeedFetcher {
    /// Creates a fetcher for the given feed URL.
    ///
    /// # Arguments
    ///
    /// * `client` - HTTP client used for every fetch (pass a custom one for tests)
    /// * `url` - The RSS or Atom feed URL to poll
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        FeedFetcher {
            client,
            url: url.into(),
            etag: String::new(),
            modified: String::new(),
        }
    }

    /// The URL this fetcher polls.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// ETag recorded from the last successful fetch, empty if none.
    pub fn etag(&self) -> &str {
        &self.etag
    }

    /// Last-Modified recorded from the last successful fetch, empty if none.
    pub fn modified(&self) -> &str {
        &self.modified
    }

    /// Fetches and parses the feed.
    ///
    /// The stored etag and last-modified are updated only after a successful
    /// response body has also parsed, so a failed parse never poisons the
    /// conditional state.
    ///
    /// # Returns
    ///
    /// The parsed feed. Exactly one of the feed or an error is produced; on
    /// a 304 the stored conditional state is left untouched.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Http`] - Any response status outside [200, 300),
    ///   including 304 Not Modified, which signals the caller that the
    ///   conditional headers matched and there is nothing new
    /// - [`FetchError::Network`] - Connection, DNS, or TLS errors
    /// - [`FetchError::Timeout`] - Request exceeded the 45 second deadline
    /// - [`FetchError::UnknownEncoding`] / [`FetchError::Decode`] - The
    ///   response declared an unsupported or corrupt content encoding
    /// - [`FetchError::Parse`] - Body was not valid RSS or Atom
    pub async fn fetch(&mut self) -> Result<Feed, FetchError> {
        let mut request = self
            .client
            .get(&self.url)
            .header(header::USER_AGENT, crate::version::user_agent())
            .header(header::ACCEPT, headers::ACCEPT_FEED)
            .header(header::ACCEPT_ENCODING, headers::ACCEPT_ENCODING)
            .header(header::CACHE_CONTROL, headers::CACHE_CONTROL)
            .header(header::REFERER, headers::REFERER)
            .header(headers::AIM, headers::AIM_FEED);

        // Send the conditional headers if the server gave us state before.
        if !self.etag.is_empty() {
            request = request.header(header::IF_NONE_MATCH, &self.etag);
        }
        if !self.modified.is_empty() {
            request = request.header(header::IF_MODIFIED_SINCE, &self.modified);
        }

        let response = tokio::time::timeout(FETCH_TIMEOUT, request.send())
            .await
            .map_err(|_| FetchError::Timeout)??;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::http(status));
        }

        let etag = header_value(&response, header::ETAG);
        let modified = header_value(&response, header::LAST_MODIFIED);
        let encoding = header_value(&response, header::CONTENT_ENCODING);

        // We advertised Accept-Encoding ourselves, so the transport hands us
        // the body exactly as the server compressed it.
        let body = response.bytes().await?;
        let body = decode_body(&encoding, &body)?;

        let feed = feed_rs::parser::parse(body.as_slice())
            .map_err(|err| FetchError::Parse(err.to_string()))?;

        self.etag = etag;
        self.modified = modified;
        Ok(feed)
    }
}

fn header_value(response: &reqwest::Response, name: header::HeaderName) -> String {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use feed_rs::model::FeedType;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

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

    const ATOM1: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Sample Feed</title>
  <id>urn:uuid:60a76c80-d399-11d9-b93C-0003939e0af6</id>
  <updated>2005-11-09T11:56:34Z</updated>
  <entry>
    <title>First entry title</title>
    <id>urn:uuid:1225c695-cfb8-4ebb-aaaa-80da344efa6a</id>
    <updated>2005-11-09T11:56:34Z</updated>
    <link href="http://example.org/entry/3"/>
  </entry>
</feed>"#;

    #[tokio::test]
    async fn test_rss_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(RSS2, "text/xml"),
            )
            .mount(&server)
            .await;

        let mut fetcher = FeedFetcher::new(reqwest::Client::new(), format!("{}/rss", server.uri()));
        let feed = fetcher.fetch().await.unwrap();
        assert_eq!(feed.feed_type, FeedType::RSS2);
        assert_eq!(feed.title.unwrap().content, "Sample Feed");
        assert_eq!(feed.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_atom_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(ATOM1, "application/atom+xml"),
            )
            .mount(&server)
            .await;

        let mut fetcher =
            FeedFetcher::new(reqwest::Client::new(), format!("{}/atom", server.uri()));
        let feed = fetcher.fetch().await.unwrap();
        assert_eq!(feed.feed_type, FeedType::Atom);
        assert_eq!(feed.title.unwrap().content, "Sample Feed");
        assert_eq!(feed.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_send_etag() {
        let server = MockServer::start().await;

        // A request carrying the etag gets 304, everything else gets the feed.
        Mock::given(method("GET"))
            .and(header("If-None-Match", "ABCDEFG"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(ATOM1, "application/atom+xml")
                    .insert_header("ETag", "ABCDEFG"),
            )
            .mount(&server)
            .await;

        let mut fetcher = FeedFetcher::new(reqwest::Client::new(), server.uri());

        // The first fetch returns the feed and records the etag.
        let feed = fetcher.fetch().await.unwrap();
        assert_eq!(feed.title.unwrap().content, "Sample Feed");
        assert_eq!(fetcher.etag(), "ABCDEFG");

        // The second fetch sends If-None-Match and surfaces the 304.
        let err = fetcher.fetch().await.unwrap_err();
        assert!(err.not_modified(), "expected a 304 http error, got {err:?}");
        assert_eq!(fetcher.etag(), "ABCDEFG", "etag must survive a 304");
    }

    #[tokio::test]
    async fn test_send_last_modified() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(header("If-Modified-Since", "Wed, 21 Oct 2015 07:28:00 GMT"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(RSS2, "text/xml")
                    .insert_header("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT"),
            )
            .mount(&server)
            .await;

        let mut fetcher = FeedFetcher::new(reqwest::Client::new(), server.uri());

        let feed = fetcher.fetch().await.unwrap();
        assert_eq!(feed.title.unwrap().content, "Sample Feed");
        assert_eq!(fetcher.modified(), "Wed, 21 Oct 2015 07:28:00 GMT");

        let err = fetcher.fetch().await.unwrap_err();
        assert!(err.not_modified(), "expected a 304 http error, got {err:?}");
        assert_eq!(fetcher.modified(), "Wed, 21 Oct 2015 07:28:00 GMT");
    }

    #[tokio::test]
    async fn test_feed_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let mut fetcher = FeedFetcher::new(reqwest::Client::new(), server.uri());
        let err = fetcher.fetch().await.unwrap_err();
        assert!(err.is_http(), "expected an http error, got {err:?}");
        assert_eq!(err.status_code(), Some(400));
        assert!(!err.status_line().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_parse_error_keeps_state_clean() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("<not a feed", "text/xml")
                    .insert_header("ETag", "SHOULD-NOT-STICK"),
            )
            .mount(&server)
            .await;

        let mut fetcher = FeedFetcher::new(reqwest::Client::new(), server.uri());
        let err = fetcher.fetch().await.unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
        assert_eq!(fetcher.etag(), "", "etag must not update on a failed parse");
    }

    #[tokio::test]
    async fn test_gzip_feed_body_is_decoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(crate::fetch::testutil::gzip(RSS2.as_bytes()), "text/xml")
                    .insert_header("Content-Encoding", "gzip"),
            )
            .mount(&server)
            .await;

        let mut fetcher = FeedFetcher::new(reqwest::Client::new(), server.uri());
        let feed = fetcher.fetch().await.unwrap();
        assert_eq!(feed.title.unwrap().content, "Sample Feed");
    }

    #[tokio::test]
    async fn test_request_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("A-IM", "feed"))
            .and(header("Cache-Control", "max-age=3600"))
            .and(header("Accept-Encoding", "gzip,deflate,br,*"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(RSS2, "text/xml"))
            .expect(1)
            .mount(&server)
            .await;

        let mut fetcher = FeedFetcher::new(reqwest::Client::new(), server.uri());
        fetcher.fetch().await.unwrap();
    }
}
