use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;

use http::HeaderMap;
use url::Url;

use super::{RetryAttempt, SansIoPolicy};
use crate::config::LoggingOptions;
use crate::error::PipelineError;
use crate::message::Message;
use crate::response::HttpResponse;

const REDACTED: &str = "REDACTED";

/// Logged as-is unless the configuration adds more.
const DEFAULT_ALLOWED_HEADERS: &[&str] = &[
    "accept",
    "cache-control",
    "content-length",
    "content-type",
    "date",
    "etag",
    "last-modified",
    "location",
    "retry-after",
    "user-agent",
    "x-ms-client-request-id",
    "x-ms-request-id",
    "x-retry-attempt",
];

/// Never logged, even when allow-listed.
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "proxy-authorization",
    "set-cookie",
];

fn is_sensitive(name: &str) -> bool {
    SENSITIVE_HEADERS.contains(&name) || (name.starts_with("x-ms-") && name.ends_with("-key"))
}

#[derive(Debug, Clone, Copy)]
struct RequestStart(Instant);

/// Logs every request as it reaches the wire, with secrets redacted.
#[derive(Debug, Clone)]
pub struct LoggingPolicy {
    allowed_headers: Arc<BTreeSet<String>>,
    allowed_query_params: Arc<BTreeSet<String>>,
}

impl Default for LoggingPolicy {
    fn default() -> Self {
        Self::new(&LoggingOptions::default())
    }
}

impl LoggingPolicy {
    #[must_use]
    pub fn new(options: &LoggingOptions) -> Self {
        let allowed_headers = DEFAULT_ALLOWED_HEADERS
            .iter()
            .map(|name| (*name).to_owned())
            .chain(
                options
                    .allowed_header_names
                    .iter()
                    .map(|name| name.to_ascii_lowercase()),
            )
            .collect();
        Self {
            allowed_headers: Arc::new(allowed_headers),
            allowed_query_params: Arc::new(options.allowed_query_params.clone()),
        }
    }

    /// `name: value` pairs with values outside the allow list redacted.
    #[must_use]
    pub fn redact_headers(&self, headers: &HeaderMap) -> String {
        let mut out = String::new();
        for (name, value) in headers {
            let name = name.as_str();
            let shown = if !is_sensitive(name) && self.allowed_headers.contains(name) {
                value.to_str().unwrap_or(REDACTED)
            } else {
                REDACTED
            };
            if !out.is_empty() {
                out.push_str(", ");
            }
            write!(out, "{name}: {shown}").ok();
        }
        out
    }

    /// URL with credentials and non-allowed query values removed.
    #[must_use]
    pub fn sanitize_url(&self, url: &Url) -> String {
        let mut url = url.clone();
        url.set_password(None).ok();
        url.set_username("").ok();
        if url.query().is_some() {
            let pairs: Vec<(String, String)> = url
                .query_pairs()
                .map(|(name, value)| {
                    let value = if self.allowed_query_params.contains(name.as_ref()) {
                        value.into_owned()
                    } else {
                        REDACTED.to_owned()
                    };
                    (name.into_owned(), value)
                })
                .collect();
            url.query_pairs_mut().clear().extend_pairs(pairs);
        }
        url.into()
    }

    fn elapsed_ms(message: &Message) -> u128 {
        message
            .context()
            .get::<RequestStart>()
            .map_or(0, |RequestStart(start)| start.elapsed().as_millis())
    }
}

impl SansIoPolicy for LoggingPolicy {
    fn on_request(&self, message: &mut Message) -> Result<ControlFlow<HttpResponse>, PipelineError> {
        message.context_mut().insert(RequestStart(Instant::now()));
        if tracing::enabled!(tracing::Level::DEBUG) {
            let request = message.request();
            let attempt = message.context().get::<RetryAttempt>().map_or(0, |a| a.0);
            tracing::debug!(
                method = %request.method(),
                url = %self.sanitize_url(request.url()),
                attempt,
                headers = %self.redact_headers(request.headers()),
                "Sending request"
            );
        }
        Ok(ControlFlow::Continue(()))
    }

    fn on_response(&self, message: &mut Message) -> Result<(), PipelineError> {
        if let Some(response) = message.response() {
            tracing::debug!(
                status = response.status().as_u16(),
                elapsed_ms = Self::elapsed_ms(message),
                headers = %self.redact_headers(response.headers()),
                "Received response"
            );
        }
        Ok(())
    }

    fn on_exception(&self, message: &Message, error: PipelineError) -> PipelineError {
        let request = message.request();
        if let PipelineError::Transport(transport) = &error {
            tracing::warn!(
                method = %request.method(),
                url = %self.sanitize_url(request.url()),
                kind = %transport.kind(),
                elapsed_ms = Self::elapsed_ms(message),
                error = %transport,
                "Request failed before a response was received"
            );
        } else {
            tracing::debug!(error = %error, "Request failed");
        }
        error
    }

    fn name(&self) -> &str {
        "logging"
    }
}
