use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use thiserror::Error;

use crate::response::{HttpResponse, parse_retry_after};

/// Boxed error used as the source of transport and decode failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Where in the exchange a transport failure happened.
///
/// The retry policy uses this to decide whether a non-idempotent request
/// may be re-sent: only failures that happened before the request reached
/// the server are safe to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportErrorKind {
    /// Connection could not be established (refused, DNS, unreachable)
    Connect,
    /// TLS handshake failed
    Tls,
    /// Connecting took longer than `connection_timeout`
    ConnectTimeout,
    /// No complete response within `read_timeout`
    ReadTimeout,
    /// Connection reset or aborted mid-exchange
    ConnectionReset,
    /// Proxy refused or failed the tunnel
    Proxy,
    /// Any other I/O or protocol failure
    Io,
}

impl TransportErrorKind {
    /// Returns `true` if the failure is guaranteed to have happened before
    /// any byte of the request was processed by the server.
    #[must_use]
    pub fn is_before_request_sent(self) -> bool {
        matches!(
            self,
            Self::Connect | Self::Tls | Self::ConnectTimeout | Self::Proxy
        )
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::ConnectTimeout => "connect timeout",
            Self::ReadTimeout => "read timeout",
            Self::ConnectionReset => "connection reset",
            Self::Proxy => "proxy",
            Self::Io => "io",
        };
        f.write_str(name)
    }
}

/// Failure raised by a transport before a response was available.
#[derive(Debug, Error)]
#[error("Transport error ({kind}): {source}")]
pub struct TransportError {
    kind: TransportErrorKind,
    #[source]
    source: BoxError,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    #[must_use]
    pub fn is_before_request_sent(&self) -> bool {
        self.kind.is_before_request_sent()
    }
}

/// A response was received but its status is treated as a failure.
///
/// Carries the original status, headers and full (size-limited) body so
/// callers can inspect exactly what the server returned.
#[derive(Debug, Clone, Error)]
#[error("HTTP {status}: {}", String::from_utf8_lossy(.body))]
pub struct HttpResponseError {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub content_type: Option<String>,
    /// Parsed `Retry-After` header value, if present and valid
    pub retry_after: Option<Duration>,
}

impl HttpResponseError {
    #[must_use]
    pub fn from_response(response: &HttpResponse) -> Self {
        Self {
            status: response.status(),
            headers: response.headers().clone(),
            body: response.body().clone(),
            content_type: response.content_type().map(str::to_owned),
            retry_after: parse_retry_after(response.headers()),
        }
    }

    /// Body decoded as UTF-8 (lossy).
    #[must_use]
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// The body could not be parsed according to its declared content type.
#[derive(Debug, Error)]
#[error("Failed to decode '{content_type}' body ({} bytes): {source}", .body.len())]
pub struct DecodeError {
    pub content_type: String,
    /// Raw body exactly as received
    pub body: Bytes,
    #[source]
    pub source: BoxError,
}

/// Errors reported by a token credential.
///
/// `Clone` so a single refresh result can be handed to every waiter.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CredentialError {
    #[error("Credential unavailable: {0}")]
    Unavailable(String),

    #[error("Token acquisition failed: {message}")]
    Acquisition {
        message: String,
        #[source]
        source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Invalid credential configuration: {0}")]
    Config(String),
}

/// Error returned by pipelines, policies and transports.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    HttpResponse(#[from] HttpResponseError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Redirect cap reached; the last 3xx response is kept for inspection
    #[error("Exceeded {max_redirects} redirects (last status {})", .response.status())]
    TooManyRedirects {
        max_redirects: usize,
        response: Box<HttpResponse>,
    },

    /// Retry budget spent on transport failures; `last` is the final cause
    #[error("Request failed after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<PipelineError>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// A single-use body was already consumed and another attempt was needed
    #[error("Request body is a consumed single-use stream and cannot be replayed")]
    BodyNotReplayable {
        #[source]
        cause: Option<Box<PipelineError>>,
    },

    #[error("Failed to read request body: {0}")]
    BodyRead(#[source] std::io::Error),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Response body too large: limit {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Transport is closed")]
    TransportClosed,

    #[error("Pipeline completed without producing a response")]
    MissingResponse,
}

impl PipelineError {
    /// The most specific underlying cause, looking through retry exhaustion.
    #[must_use]
    pub fn most_specific(&self) -> &Self {
        match self {
            Self::RetryExhausted { last, .. } => last.most_specific(),
            other => other,
        }
    }

    /// Status code of the response behind this error, if any.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self.most_specific() {
            Self::HttpResponse(err) => Some(err.status),
            Self::TooManyRedirects { response, .. } => Some(response.status()),
            _ => None,
        }
    }

    /// Whether retrying the same request could plausibly succeed.
    ///
    /// Transport failures and throttling or server-side statuses qualify;
    /// everything else is deterministic.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.most_specific() {
            Self::Transport(_) => true,
            Self::HttpResponse(err) => {
                err.status == StatusCode::REQUEST_TIMEOUT
                    || err.status == StatusCode::TOO_MANY_REQUESTS
                    || err.status.is_server_error()
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Transport failure kind, if this error is a transport failure.
    #[must_use]
    pub fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Self::Transport(err) => Some(err.kind()),
            _ => None,
        }
    }
}

impl From<http::header::InvalidHeaderName> for PipelineError {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        Self::InvalidHeader(err.to_string())
    }
}

impl From<http::header::InvalidHeaderValue> for PipelineError {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        Self::InvalidHeader(err.to_string())
    }
}
