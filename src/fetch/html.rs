use reqwest::header;
use scraper::Selector;
use std::sync::OnceLock;

use super::{decode_body, headers, FetchError, FETCH_TIMEOUT};

/// Retrieves the HTML body of a single article URL.
///
/// Unlike the feed fetcher there is no conditional state: articles are
/// fetched once per feed item, so the request carries the standard header
/// set minus `A-IM` and the conditional pair.
pub struct HtmlFetcher {
    client: reqwest::Client,
    url: String,
}

impl HtmlFetcher {
    /// Creates a fetcher for the given article URL.
    ///
    /// # Arguments
    ///
    /// * `client` - HTTP client used for the fetch (pass a custom one for tests)
    /// * `url` - The article URL to retrieve
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        HtmlFetcher {
            client,
            url: url.into(),
        }
    }

    /// The URL this fetcher retrieves.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetches the article.
    ///
    /// # Returns
    ///
    /// An [`Html`] view over the raw response bytes. The body is kept
    /// exactly as received; decoding happens lazily in [`Html::extract`].
    ///
    /// # Errors
    ///
    /// - [`FetchError::Http`] - Any response status outside [200, 300)
    /// - [`FetchError::Network`] - Connection, DNS, or TLS errors
    /// - [`FetchError::Timeout`] - Request exceeded the 45 second deadline
    pub async fn fetch(&self) -> Result<Html, FetchError> {
        let request = self
            .client
            .get(&self.url)
            .header(header::USER_AGENT, crate::version::user_agent())
            .header(header::ACCEPT, headers::ACCEPT_HTML)
            .header(header::ACCEPT_ENCODING, headers::ACCEPT_ENCODING)
            .header(header::CACHE_CONTROL, headers::CACHE_CONTROL)
            .header(header::REFERER, headers::REFERER);

        let response = tokio::time::timeout(FETCH_TIMEOUT, request.send())
            .await
            .map_err(|_| FetchError::Timeout)??;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::http(status));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let encoding = response
            .headers()
            .get(header::CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let content = response.bytes().await?.to_vec();
        Ok(Html::new(content, content_type, encoding))
    }
}

/// An in-memory view of a fetched HTML page.
///
/// The raw response body is held undecoded alongside the `Content-Type` and
/// `Content-Encoding` headers it arrived with. [`extract`](Html::extract)
/// decompresses on first use and caches the result, so repeated calls to
/// `extract`, [`title`](Html::title), and [`description`](Html::description)
/// are idempotent and never refetch.
#[derive(Debug)]
pub struct Html {
    content: Vec<u8>,
    content_type: String,
    encoding: String,
    decoded: OnceLock<Vec<u8>>,
    meta: OnceLock<PageMeta>,
}

#[derive(Debug, Default)]
struct PageMeta {
    title: String,
    description: String,
}

impl Html {
    pub(crate) fn new(content: Vec<u8>, content_type: String, encoding: String) -> Self {
        Html {
            content,
            content_type,
            encoding,
            decoded: OnceLock::new(),
            meta: OnceLock::new(),
        }
    }

    /// The raw, undecoded response body.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// The response `Content-Type` header, empty if absent.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// The response `Content-Encoding` header, empty if absent.
    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    /// Returns the decoded body bytes, decompressing per the declared
    /// content encoding on first call and serving the cached copy after.
    ///
    /// # Errors
    ///
    /// - [`FetchError::UnknownEncoding`] - The response declared an
    ///   encoding outside the supported table
    /// - [`FetchError::Decode`] - The compressed body was corrupt or
    ///   truncated
    pub fn extract(&self) -> Result<Vec<u8>, FetchError> {
        if let Some(decoded) = self.decoded.get() {
            return Ok(decoded.clone());
        }
        let decoded = decode_body(&self.encoding, &self.content)?;
        Ok(self.decoded.get_or_init(|| decoded).clone())
    }

    /// The text of the first `<title>` element, empty if the page has none
    /// or the body cannot be decoded.
    pub fn title(&self) -> &str {
        &self.page_meta().title
    }

    /// The `content` attribute of the first `<meta name="description">`
    /// whose value is non-empty, empty otherwise.
    pub fn description(&self) -> &str {
        &self.page_meta().description
    }

    fn page_meta(&self) -> &PageMeta {
        self.meta.get_or_init(|| {
            let Ok(decoded) = self.extract() else {
                return PageMeta::default();
            };
            let body = String::from_utf8_lossy(&decoded);
            let document = scraper::Html::parse_document(&body);

            let title_selector = Selector::parse("title").expect("static selector");
            let title = document
                .select(&title_selector)
                .next()
                .map(|element| element.text().collect::<String>().trim().to_string())
                .unwrap_or_default();

            let meta_selector =
                Selector::parse(r#"meta[name="description"]"#).expect("static selector");
            let description = document
                .select(&meta_selector)
                .filter_map(|element| element.value().attr("content"))
                .map(str::trim)
                .find(|content| !content.is_empty())
                .unwrap_or_default()
                .to_string();

            PageMeta { title, description }
        })
    }
}
