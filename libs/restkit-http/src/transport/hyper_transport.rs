use std::error::Error;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::{HeaderValue, Uri};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tower::ServiceExt;
use tower_http::decompression::{Decompression, DecompressionBody};
use url::Url;
use zeroize::Zeroizing;

use super::{
    AsyncTransport, PoolOwnership, check_scheme, exchange_failure_kind, io_error_kind,
    is_tls_failure,
};
use crate::config::TransportConfig;
use crate::error::{BoxError, PipelineError, TransportError, TransportErrorKind};
use crate::request::HttpRequest;
use crate::response::HttpResponse;
use crate::tls;

type DirectClient = Decompression<Client<HttpsConnector<HttpConnector>, Full<Bytes>>>;
type TunneledClient = Decompression<Client<HttpsConnector<Tunnel<HttpConnector>>, Full<Bytes>>>;

#[derive(Clone)]
enum HyperClient {
    Direct(DirectClient),
    Tunneled(TunneledClient),
}

impl HyperClient {
    async fn call(
        &self,
        request: http::Request<Full<Bytes>>,
    ) -> Result<http::Response<DecompressionBody<Incoming>>, hyper_util::client::legacy::Error> {
        match self {
            Self::Direct(service) => service.clone().oneshot(request).await,
            Self::Tunneled(service) => service.clone().oneshot(request).await,
        }
    }

    fn is_tunneled(&self) -> bool {
        matches!(self, Self::Tunneled(_))
    }
}

struct PoolInner {
    client: HyperClient,
    permits: Semaphore,
}

/// A hyper client and its pooled connections.
///
/// Clones share the pool. Hand a clone to [`HyperTransport::with_pool`] to
/// let several transports reuse the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Build a pool from the connection, TLS and proxy settings of `config`.
    ///
    /// # Errors
    /// Returns `PipelineError::Config` for an invalid proxy URL or when no
    /// usable TLS roots are available.
    pub fn new(config: &TransportConfig) -> Result<Self, PipelineError> {
        if config.max_connections == 0 {
            return Err(PipelineError::Config(
                "max_connections must be at least 1".to_owned(),
            ));
        }
        if config.allows_insecure_http() {
            tracing::warn!(
                "insecure HTTP enabled (TransportSecurity::AllowInsecureHttp); \
                 use only for testing with mock servers"
            );
        }

        let tls = tls::client_config(config)?;
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(Some(config.connection_timeout));

        let mut builder = Client::builder(TokioExecutor::new());
        builder
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(config.max_connections)
            .pool_idle_timeout(config.pool_idle_timeout);

        let connector = HttpsConnectorBuilder::new().with_tls_config(tls);
        let connector = if config.allows_insecure_http() {
            connector.https_or_http()
        } else {
            connector.https_only()
        }
        .enable_all_versions();

        let client = match &config.proxy {
            None => HyperClient::Direct(Decompression::new(
                builder.build(connector.wrap_connector(http)),
            )),
            Some(proxy) => HyperClient::Tunneled(Decompression::new(
                builder.build(connector.wrap_connector(proxy_tunnel(proxy, http)?)),
            )),
        };

        Ok(Self {
            inner: Arc::new(PoolInner {
                client,
                permits: Semaphore::new(config.max_connections),
            }),
        })
    }

    /// Requests that may be started without waiting for a slot.
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.inner.permits.available_permits()
    }

    async fn send(
        &self,
        request: &HttpRequest,
        config: &TransportConfig,
    ) -> Result<HttpResponse, PipelineError> {
        let outgoing = to_hyper_request(request)?;
        let _permit = self
            .inner
            .permits
            .acquire()
            .await
            .map_err(|_| PipelineError::TransportClosed)?;

        let exchange = async {
            let response = self
                .inner
                .client
                .call(outgoing)
                .await
                .map_err(|e| {
                    let kind = classify(&e, self.inner.client.is_tunneled());
                    TransportError::new(kind, e)
                })?;
            let (parts, body) = response.into_parts();
            let body = Limited::new(body, config.max_body_size)
                .collect()
                .await
                .map_err(|e| body_error(e, config.max_body_size))?
                .to_bytes();
            Ok(HttpResponse::new(
                parts.status,
                parts.headers,
                body,
                request.clone(),
            ))
        };

        match tokio::time::timeout(config.read_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::new(
                TransportErrorKind::ReadTimeout,
                format!(
                    "no complete response within {}ms",
                    config.read_timeout.as_millis()
                ),
            )
            .into()),
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("tunneled", &self.inner.client.is_tunneled())
            .field("available_slots", &self.available_slots())
            .finish()
    }
}

/// CONNECT tunnel through an `http://` proxy, with basic auth taken from
/// the proxy URL's user info.
fn proxy_tunnel(proxy: &str, http: HttpConnector) -> Result<Tunnel<HttpConnector>, PipelineError> {
    let url = Url::parse(proxy)
        .map_err(|e| PipelineError::Config(format!("invalid proxy URL: {e}")))?;
    if url.scheme() != "http" {
        return Err(PipelineError::Config(format!(
            "unsupported proxy scheme '{}'",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| PipelineError::Config("proxy URL has no host".to_owned()))?;
    let port = url.port_or_known_default().unwrap_or(80);
    let destination: Uri = format!("http://{host}:{port}")
        .parse()
        .map_err(|e| PipelineError::Config(format!("invalid proxy URL: {e}")))?;

    let mut tunnel = Tunnel::new(destination, http);
    if !url.username().is_empty() {
        let credentials = Zeroizing::new(format!(
            "{}:{}",
            url.username(),
            url.password().unwrap_or_default()
        ));
        let raw = Zeroizing::new(format!("Basic {}", STANDARD.encode(credentials.as_bytes())));
        let mut value = HeaderValue::from_str(&raw)?;
        value.set_sensitive(true);
        tunnel = tunnel.with_auth(value);
    }
    Ok(tunnel)
}

fn to_hyper_request(request: &HttpRequest) -> Result<http::Request<Full<Bytes>>, PipelineError> {
    let uri: Uri = request
        .url()
        .as_str()
        .parse()
        .map_err(|e| PipelineError::InvalidRequest(format!("invalid request URI: {e}")))?;
    let body = request.body().read_all()?;

    let mut outgoing = http::Request::new(Full::new(body));
    *outgoing.method_mut() = request.method().clone();
    *outgoing.uri_mut() = uri;
    *outgoing.headers_mut() = request.headers().clone();
    Ok(outgoing)
}

fn classify(error: &hyper_util::client::legacy::Error, tunneled: bool) -> TransportErrorKind {
    if is_tls_failure(error) {
        return TransportErrorKind::Tls;
    }
    let io_kind = io_error_kind(error);
    if error.is_connect() {
        return match io_kind {
            Some(std::io::ErrorKind::TimedOut) => TransportErrorKind::ConnectTimeout,
            _ if tunneled => TransportErrorKind::Proxy,
            _ => TransportErrorKind::Connect,
        };
    }
    if is_interrupted(error) {
        return TransportErrorKind::ConnectionReset;
    }
    exchange_failure_kind(io_kind)
}

/// The connection went away before the response was complete.
fn is_interrupted(error: &(dyn Error + 'static)) -> bool {
    let mut cause = Some(error);
    while let Some(current) = cause {
        if let Some(hyper_error) = current.downcast_ref::<hyper::Error>()
            && (hyper_error.is_incomplete_message() || hyper_error.is_canceled())
        {
            return true;
        }
        cause = current.source();
    }
    false
}

fn body_error(error: BoxError, limit: usize) -> PipelineError {
    if error.is::<LengthLimitError>() {
        return PipelineError::BodyTooLarge { limit };
    }
    let cause: &(dyn Error + 'static) = &*error;
    let kind = if is_interrupted(cause) {
        TransportErrorKind::ConnectionReset
    } else {
        exchange_failure_kind(io_error_kind(cause))
    };
    TransportError::new(kind, error).into()
}

#[derive(Default)]
struct PoolState {
    pool: Option<ConnectionPool>,
    closed: bool,
}

/// Async transport over hyper with rustls.
///
/// Responses are decompressed (gzip, br, deflate) and buffered up to
/// `max_body_size`.
pub struct HyperTransport {
    config: TransportConfig,
    ownership: PoolOwnership,
    state: Mutex<PoolState>,
}

impl HyperTransport {
    /// Transport that builds and owns its pool on first use.
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            ownership: PoolOwnership::Owned,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Transport over a pool shared with other holders.
    ///
    /// Connection, TLS and proxy settings come from the pool; timeouts and
    /// the body limit from `config`.
    #[must_use]
    pub fn with_pool(pool: ConnectionPool, config: TransportConfig) -> Self {
        Self {
            config,
            ownership: PoolOwnership::Borrowed,
            state: Mutex::new(PoolState {
                pool: Some(pool),
                closed: false,
            }),
        }
    }

    #[must_use]
    pub fn ownership(&self) -> PoolOwnership {
        self.ownership
    }

    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Whether a pool is attached and the transport accepts sends.
    #[must_use]
    pub fn is_open(&self) -> bool {
        let state = self.state.lock();
        !state.closed && state.pool.is_some()
    }

    fn checkout(&self) -> Result<ConnectionPool, PipelineError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PipelineError::TransportClosed);
        }
        if let Some(pool) = &state.pool {
            return Ok(pool.clone());
        }
        let pool = ConnectionPool::new(&self.config)?;
        state.pool = Some(pool.clone());
        Ok(pool)
    }
}

impl fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HyperTransport")
            .field("ownership", &self.ownership)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AsyncTransport for HyperTransport {
    async fn open(&self) -> Result<(), PipelineError> {
        let mut state = self.state.lock();
        if state.pool.is_none() {
            state.pool = Some(ConnectionPool::new(&self.config)?);
        }
        state.closed = false;
        Ok(())
    }

    async fn close(&self) {
        let released = {
            let mut state = self.state.lock();
            state.closed = true;
            match self.ownership {
                PoolOwnership::Owned => state.pool.take(),
                PoolOwnership::Borrowed => None,
            }
        };
        tracing::debug!(
            ownership = ?self.ownership,
            released = released.is_some(),
            "Transport closed"
        );
    }

    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, PipelineError> {
        check_scheme(request, self.config.allows_insecure_http())?;
        let pool = self.checkout()?;
        pool.send(request, &self.config).await
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use http::StatusCode;
    use httpmock::prelude::*;
    use std::time::Duration;

    fn request(server: &MockServer, path: &str) -> HttpRequest {
        HttpRequest::parse(http::Method::GET, &server.url(path)).unwrap()
    }

    #[tokio::test]
    async fn test_send_returns_any_status() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/missing").header("x-probe", "1");
                then.status(404).body("not here");
            })
            .await;

        let transport = HyperTransport::new(TransportConfig::for_testing());
        let response = transport
            .send(&request(&server, "/missing").with_header("x-probe", "1").unwrap())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.text(), "not here");
    }

    #[tokio::test]
    async fn test_plain_http_rejected_by_default() {
        let server = MockServer::start_async().await;
        let transport = HyperTransport::new(TransportConfig::default());
        let err = transport.send(&request(&server, "/")).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_body_limit_is_enforced() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/large");
                then.status(200).body("x".repeat(4096));
            })
            .await;

        let config = TransportConfig {
            max_body_size: 1024,
            ..TransportConfig::for_testing()
        };
        let transport = HyperTransport::new(config);
        let err = transport.send(&request(&server, "/large")).await.unwrap_err();
        assert!(matches!(err, PipelineError::BodyTooLarge { limit: 1024 }));
    }

    #[tokio::test]
    async fn test_slow_response_is_read_timeout() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/slow");
                then.status(200).delay(Duration::from_millis(500));
            })
            .await;

        let config = TransportConfig {
            read_timeout: Duration::from_millis(50),
            ..TransportConfig::for_testing()
        };
        let err = HyperTransport::new(config)
            .send(&request(&server, "/slow"))
            .await
            .unwrap_err();
        assert_eq!(err.transport_kind(), Some(TransportErrorKind::ReadTimeout));
    }

    #[tokio::test]
    async fn test_refused_connection_is_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = HyperTransport::new(TransportConfig::for_testing());
        let target = HttpRequest::parse(http::Method::GET, &format!("http://127.0.0.1:{port}/"))
            .unwrap();
        let err = transport.send(&target).await.unwrap_err();

        assert_eq!(err.transport_kind(), Some(TransportErrorKind::Connect));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_close_rejects_until_reopened() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/ok");
                then.status(200);
            })
            .await;

        let transport = HyperTransport::new(TransportConfig::for_testing());
        assert!(!transport.is_open());
        transport.send(&request(&server, "/ok")).await.unwrap();
        assert!(transport.is_open());

        transport.close().await;
        let err = transport.send(&request(&server, "/ok")).await.unwrap_err();
        assert!(matches!(err, PipelineError::TransportClosed));

        transport.open().await.unwrap();
        transport.send(&request(&server, "/ok")).await.unwrap();
    }

    #[tokio::test]
    async fn test_closing_borrower_keeps_shared_pool() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/ok");
                then.status(200);
            })
            .await;

        let config = TransportConfig::for_testing();
        let pool = ConnectionPool::new(&config).unwrap();
        let first = HyperTransport::with_pool(pool.clone(), config.clone());
        let second = HyperTransport::with_pool(pool, config);
        assert_eq!(first.ownership(), PoolOwnership::Borrowed);

        first.send(&request(&server, "/ok")).await.unwrap();
        first.close().await;

        second.send(&request(&server, "/ok")).await.unwrap();
        assert!(second.is_open());
    }

    #[tokio::test]
    async fn test_gzip_response_is_decompressed() {
        use std::io::Write as _;

        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"{\"compressed\":true}").unwrap();
        let compressed = encoder.finish().unwrap();

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/gz");
                then.status(200)
                    .header("content-encoding", "gzip")
                    .header("content-type", "application/json")
                    .body(compressed.clone());
            })
            .await;

        let response = HyperTransport::new(TransportConfig::for_testing())
            .send(&request(&server, "/gz"))
            .await
            .unwrap();
        assert_eq!(response.text(), "{\"compressed\":true}");
    }

    #[test]
    fn test_invalid_proxy_is_config_error() {
        let config = TransportConfig {
            proxy: Some("socks5://proxy:1080".to_owned()),
            ..TransportConfig::for_testing()
        };
        assert!(matches!(
            ConnectionPool::new(&config),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_zero_connections_is_config_error() {
        let config = TransportConfig {
            max_connections: 0,
            ..TransportConfig::for_testing()
        };
        assert!(ConnectionPool::new(&config).is_err());
    }
}
