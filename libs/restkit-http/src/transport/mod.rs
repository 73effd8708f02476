//! Transports: the terminal link of every pipeline.
//!
//! A transport sends exactly one request and buffers the response. It never
//! retries and never follows redirects; the policies above it do that.

mod hyper_transport;
mod ureq_transport;

use std::error::Error;
use std::io;

use async_trait::async_trait;

pub use hyper_transport::{ConnectionPool, HyperTransport};
pub use ureq_transport::UreqTransport;

use crate::error::{PipelineError, TransportErrorKind};
use crate::request::HttpRequest;
use crate::response::HttpResponse;

/// Whether a transport created its connection pool or was handed one.
///
/// Closing a transport only releases an owned pool; a borrowed pool stays
/// usable by everyone else holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOwnership {
    Owned,
    Borrowed,
}

/// Async transport.
#[async_trait]
pub trait AsyncTransport: Send + Sync {
    /// Prepare the connection pool. Idempotent; `send` opens lazily.
    ///
    /// # Errors
    /// Returns `PipelineError::Config` if the pool cannot be built.
    async fn open(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Release the pool if this transport owns it. Idempotent.
    async fn close(&self) {}

    /// Send one request and buffer its response.
    ///
    /// Any status code is a successful send; only failures to obtain a
    /// response are errors.
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, PipelineError>;
}

/// Blocking transport.
pub trait BlockingTransport: Send + Sync {
    /// # Errors
    /// Returns `PipelineError::Config` if the pool cannot be built.
    fn open(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    fn close(&self) {}

    /// # Errors
    /// Returns a transport, body or configuration error when no response
    /// could be obtained.
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, PipelineError>;
}

/// Reject `http://` targets unless plain HTTP was explicitly allowed.
///
/// # Errors
/// Returns `PipelineError::InvalidRequest` for a disallowed scheme.
pub fn check_scheme(request: &HttpRequest, allow_insecure: bool) -> Result<(), PipelineError> {
    match request.url().scheme() {
        "https" => Ok(()),
        "http" if allow_insecure => Ok(()),
        "http" => Err(PipelineError::InvalidRequest(format!(
            "plain HTTP is not allowed by the transport configuration: {}",
            request.url()
        ))),
        other => Err(PipelineError::InvalidRequest(format!(
            "unsupported URL scheme '{other}'"
        ))),
    }
}

/// Walk an error's source chain, including errors wrapped in `io::Error`.
fn causes<'a>(error: &'a (dyn Error + 'static)) -> impl Iterator<Item = &'a (dyn Error + 'static)> {
    std::iter::successors(Some(error), |&cause| {
        cause
            .downcast_ref::<io::Error>()
            .and_then(|io| io.get_ref().map(|inner| inner as &(dyn Error + 'static)))
            .or_else(|| cause.source())
    })
}

/// Whether a TLS failure appears anywhere in the chain.
pub(crate) fn is_tls_failure(error: &(dyn Error + 'static)) -> bool {
    causes(error).any(|cause| cause.is::<rustls::Error>())
}

/// The first I/O error kind in the chain.
pub(crate) fn io_error_kind(error: &(dyn Error + 'static)) -> Option<io::ErrorKind> {
    causes(error).find_map(|cause| cause.downcast_ref::<io::Error>().map(io::Error::kind))
}

/// Kind of an I/O failure that happened after the connection was up.
pub(crate) fn exchange_failure_kind(kind: Option<io::ErrorKind>) -> TransportErrorKind {
    match kind {
        Some(io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => TransportErrorKind::ReadTimeout,
        Some(
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof,
        ) => TransportErrorKind::ConnectionReset,
        _ => TransportErrorKind::Io,
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use http::Method;

    #[derive(Debug, thiserror::Error)]
    #[error("connect failed")]
    struct Outer(#[source] io::Error);

    #[test]
    fn test_tls_failure_is_found_inside_io_error() {
        let tls = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::General("bad certificate".to_owned()),
        );
        let err = Outer(tls);
        assert!(is_tls_failure(&err));
        assert_eq!(io_error_kind(&err), Some(io::ErrorKind::InvalidData));

        let plain = Outer(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(!is_tls_failure(&plain));
    }

    #[test]
    fn test_exchange_failure_kinds() {
        assert_eq!(
            exchange_failure_kind(Some(io::ErrorKind::TimedOut)),
            TransportErrorKind::ReadTimeout
        );
        assert_eq!(
            exchange_failure_kind(Some(io::ErrorKind::UnexpectedEof)),
            TransportErrorKind::ConnectionReset
        );
        assert_eq!(exchange_failure_kind(None), TransportErrorKind::Io);
    }

    #[test]
    fn test_check_scheme() {
        let https = HttpRequest::parse(Method::GET, "https://example.com/").unwrap();
        let http = HttpRequest::parse(Method::GET, "http://example.com/").unwrap();
        let ftp = HttpRequest::parse(Method::GET, "ftp://example.com/").unwrap();

        assert!(check_scheme(&https, false).is_ok());
        assert!(check_scheme(&http, false).is_err());
        assert!(check_scheme(&http, true).is_ok());
        assert!(matches!(
            check_scheme(&ftp, true),
            Err(PipelineError::InvalidRequest(_))
        ));
    }
}
