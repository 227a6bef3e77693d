use reqwest::StatusCode;
use std::io;
use thiserror::Error;

/// Errors that can occur while fetching feeds or articles.
///
/// The `Http` variant is the structured error for any response with a status
/// outside [200, 300) -- including 304 Not Modified, which signals to the
/// caller that conditional headers did their job and nothing has changed.
/// Every other variant is a non-HTTP failure and enters the retry path.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Server replied successfully but with a non-2xx status
    #[error("http error {code}: {status}")]
    Http {
        /// Numeric status code, e.g. 404
        code: u16,
        /// Status line as sent by the server, e.g. "404 Not Found"
        status: String,
    },
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Request exceeded the per-fetch deadline
    #[error("request timed out")]
    Timeout,
    /// Body could not be parsed as RSS or Atom
    #[error("feed parsing failed: {0}")]
    Parse(String),
    /// Response declared a Content-Encoding we cannot decode
    #[error("unknown content encoding {0:?}")]
    UnknownEncoding(String),
    /// Compressed body was corrupt or truncated
    #[error("could not decode content: {0}")]
    Decode(#[from] io::Error),
}

impl FetchError {
    /// Builds the structured HTTP error for a non-2xx response status.
    pub fn http(status: StatusCode) -> Self {
        FetchError::Http {
            code: status.as_u16(),
            status: format!(
                "{} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            ),
        }
    }

    /// True when the server replied with a non-2xx status (as opposed to a
    /// transport, parse, or decode failure).
    pub fn is_http(&self) -> bool {
        matches!(self, FetchError::Http { .. })
    }

    /// The response status code, when this is an HTTP error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            FetchError::Http { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The response status line, when this is an HTTP error.
    pub fn status_line(&self) -> Option<&str> {
        match self {
            FetchError::Http { status, .. } => Some(status),
            _ => None,
        }
    }

    /// True if the error is an HTTP 304 Not Modified.
    pub fn not_modified(&self) -> bool {
        self.status_code() == Some(304)
    }

    /// True if the error is an HTTP 404 Not Found.
    pub fn not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    /// True if the error is an HTTP 403 Forbidden.
    pub fn forbidden(&self) -> bool {
        self.status_code() == Some(403)
    }
}
