//! HTTP transport used by the download engine.
//!
//! `HttpClient`-style shape: explicit connect/read timeouts, a browser
//! `User-Agent` fallback, and error variants that carry context (URL,
//! path) rather than a bare `reqwest::Error`, so a failure can be logged
//! and classified far from the call site.

mod reqwest_client;

pub use reqwest_client::ReqwestFetchClient;

use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use thiserror::Error;

/// Response to a HEAD probe. A probe failure is tolerated by the engine,
/// not fatal — fields are therefore all best-effort.
#[derive(Debug, Clone, Default)]
pub struct HeadInfo {
    /// `Content-Length`, when present and parseable.
    pub content_length: Option<u64>,
    /// `Content-Type`, when present.
    pub content_type: Option<String>,
    /// `true` iff the server advertised `Accept-Ranges: bytes`.
    pub accepts_ranges: bool,
    /// `Content-Encoding`, when present. A non-identity encoding means
    /// the advertised length doesn't describe the decoded payload size,
    /// so the engine must not trust it as the transfer's total size.
    pub content_encoding: Option<String>,
}

/// A byte chunk pulled from a response body, or a transport failure that
/// occurred mid-stream.
pub type BodyChunk = Result<bytes::Bytes, FetchError>;

/// A streaming response body plus the headers the engine needs before
/// the first chunk arrives.
pub struct FetchBody {
    /// HTTP status code.
    pub status: u16,
    /// `Content-Length` as reported by the response, if any.
    pub content_length: Option<u64>,
    /// `Content-Encoding`, if any (see [`HeadInfo::content_encoding`]).
    pub content_encoding: Option<String>,
    /// `Content-Type`, if any.
    pub content_type: Option<String>,
    /// `Retry-After`, in seconds, if the server sent one.
    pub retry_after_secs: Option<u64>,
    /// The response body, as a stream of chunks.
    pub stream: Pin<Box<dyn Stream<Item = BodyChunk> + Send>>,
}

impl std::fmt::Debug for FetchBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchBody")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("content_encoding", &self.content_encoding)
            .field("content_type", &self.content_type)
            .field("retry_after_secs", &self.retry_after_secs)
            .finish_non_exhaustive()
    }
}

/// Transport-layer errors. Every variant carries the URL it happened on.
#[derive(Debug, Error)]
pub enum FetchError {
    /// A connection, DNS, or TLS failure, or a mid-stream read failure.
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL being fetched.
        url: String,
        /// Underlying `reqwest` error.
        #[source]
        source: reqwest::Error,
    },

    /// The request exceeded its configured timeout.
    #[error("timed out fetching {url}")]
    Timeout {
        /// The URL being fetched.
        url: String,
    },

    /// The server returned a non-success status.
    #[error("fetching {url} returned status {status}")]
    HttpStatus {
        /// The URL being fetched.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// `Retry-After`, in seconds, if present.
        retry_after: Option<u64>,
    },

    /// `url` failed to parse as an absolute URL.
    #[error("invalid url: {url}")]
    InvalidUrl {
        /// The offending URL string.
        url: String,
    },
}

impl FetchError {
    /// The HTTP status code, when this is an [`Self::HttpStatus`].
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// HTTP transport contract. The engine never touches `reqwest` directly,
/// so a host can substitute its own client (proxying, custom TLS,
/// request signing) by implementing this trait.
#[async_trait]
pub trait FetchClient: Send + Sync + std::fmt::Debug {
    /// Issues a `HEAD` request. Errors are tolerated by the engine (the
    /// probe is advisory), but are still returned here so the caller can
    /// log them.
    async fn head(&self, url: &str) -> Result<HeadInfo, FetchError>;

    /// Issues a `GET`, optionally bounded by a `Range` header:
    /// `range_start` alone sends `bytes=N-` (open-ended, read to EOF);
    /// both `range_start` and `range_end` send `bytes=N-M` (inclusive),
    /// used by the chunked transfer path to request one chunk at a time.
    /// Returns the response headers and a streaming body.
    async fn get(
        &self,
        url: &str,
        range_start: Option<u64>,
        range_end: Option<u64>,
    ) -> Result<FetchBody, FetchError>;
}
