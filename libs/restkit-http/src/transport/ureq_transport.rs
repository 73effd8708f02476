use std::fmt;
use std::io::Read;
use std::sync::Arc;

use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use parking_lot::{Condvar, Mutex};

use super::{
    BlockingTransport, PoolOwnership, check_scheme, exchange_failure_kind, io_error_kind,
    is_tls_failure,
};
use crate::config::TransportConfig;
use crate::error::{PipelineError, TransportError, TransportErrorKind};
use crate::request::HttpRequest;
use crate::response::HttpResponse;
use crate::tls;

/// Caps the number of requests one transport has on the wire.
struct InFlight {
    active: Mutex<usize>,
    released: Condvar,
    limit: usize,
}

impl InFlight {
    fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            active: Mutex::new(0),
            released: Condvar::new(),
            limit: limit.max(1),
        })
    }

    fn acquire(self: &Arc<Self>) -> InFlightSlot {
        let mut active = self.active.lock();
        while *active >= self.limit {
            self.released.wait(&mut active);
        }
        *active += 1;
        InFlightSlot(Arc::clone(self))
    }
}

struct InFlightSlot(Arc<InFlight>);

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        *self.0.active.lock() -= 1;
        self.0.released.notify_one();
    }
}

fn build_agent(config: &TransportConfig) -> Result<ureq::Agent, PipelineError> {
    let mut builder = ureq::AgentBuilder::new()
        .timeout_connect(config.connection_timeout)
        .timeout_read(config.read_timeout)
        .max_idle_connections(config.max_connections)
        .max_idle_connections_per_host(config.max_connections)
        .redirects(0)
        .tls_config(Arc::new(tls::client_config(config)?));
    if let Some(proxy) = &config.proxy {
        let proxy = ureq::Proxy::new(proxy)
            .map_err(|e| PipelineError::Config(format!("invalid proxy URL: {e}")))?;
        builder = builder.proxy(proxy);
    }
    Ok(builder.build())
}

#[derive(Default)]
struct AgentState {
    agent: Option<ureq::Agent>,
    closed: bool,
}

/// Blocking transport over `ureq`.
///
/// Runs entirely on the calling thread. Gzip responses are decompressed and
/// bodies are buffered up to `max_body_size`.
pub struct UreqTransport {
    config: TransportConfig,
    ownership: PoolOwnership,
    state: Mutex<AgentState>,
    in_flight: Arc<InFlight>,
}

impl UreqTransport {
    /// Transport that builds and owns its agent on first use.
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        let in_flight = InFlight::new(config.max_connections);
        Self {
            config,
            ownership: PoolOwnership::Owned,
            state: Mutex::new(AgentState::default()),
            in_flight,
        }
    }

    /// Transport over an agent (and its connection pool) owned elsewhere.
    #[must_use]
    pub fn with_agent(agent: ureq::Agent, config: TransportConfig) -> Self {
        let in_flight = InFlight::new(config.max_connections);
        Self {
            config,
            ownership: PoolOwnership::Borrowed,
            state: Mutex::new(AgentState {
                agent: Some(agent),
                closed: false,
            }),
            in_flight,
        }
    }

    #[must_use]
    pub fn ownership(&self) -> PoolOwnership {
        self.ownership
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        let state = self.state.lock();
        !state.closed && state.agent.is_some()
    }

    fn checkout(&self) -> Result<ureq::Agent, PipelineError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PipelineError::TransportClosed);
        }
        if let Some(agent) = &state.agent {
            return Ok(agent.clone());
        }
        let agent = build_agent(&self.config)?;
        state.agent = Some(agent.clone());
        Ok(agent)
    }

    fn exchange(&self, agent: &ureq::Agent, request: &HttpRequest) -> Result<HttpResponse, PipelineError> {
        let body = request.body().read_all()?;
        let mut outgoing = agent.request_url(request.method().as_str(), request.url());
        for name in request.headers().keys() {
            if *name == header::CONTENT_LENGTH {
                continue;
            }
            let values: Vec<&str> = request
                .headers()
                .get_all(name)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .collect();
            outgoing = outgoing.set(name.as_str(), &values.join(", "));
        }

        let response = match outgoing.send_bytes(&body) {
            Ok(response) | Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(transport)) => return Err(transport_failure(transport)),
        };
        self.read_response(response, request)
    }

    fn read_response(
        &self,
        response: ureq::Response,
        request: &HttpRequest,
    ) -> Result<HttpResponse, PipelineError> {
        let status = StatusCode::from_u16(response.status())
            .map_err(|e| TransportError::new(TransportErrorKind::Io, e))?;

        let mut headers = HeaderMap::new();
        for name in response.headers_names() {
            let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in response.all(&name) {
                if let Ok(value) = HeaderValue::from_str(value) {
                    headers.append(header_name.clone(), value);
                }
            }
        }

        let limit = self.config.max_body_size;
        let mut body = Vec::new();
        response
            .into_reader()
            .take(u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1))
            .read_to_end(&mut body)
            .map_err(|e| TransportError::new(exchange_failure_kind(Some(e.kind())), e))?;
        if body.len() > limit {
            return Err(PipelineError::BodyTooLarge { limit });
        }

        Ok(HttpResponse::new(status, headers, body.into(), request.clone()))
    }
}

fn transport_failure(error: ureq::Transport) -> PipelineError {
    let kind = match error.kind() {
        ureq::ErrorKind::InvalidUrl
        | ureq::ErrorKind::UnknownScheme
        | ureq::ErrorKind::InsecureRequestHttpsOnly => {
            return PipelineError::InvalidRequest(error.to_string());
        }
        ureq::ErrorKind::InvalidProxyUrl => return PipelineError::Config(error.to_string()),
        ureq::ErrorKind::Dns => TransportErrorKind::Connect,
        ureq::ErrorKind::ProxyConnect | ureq::ErrorKind::ProxyUnauthorized => {
            TransportErrorKind::Proxy
        }
        ureq::ErrorKind::ConnectionFailed if is_tls_failure(&error) => TransportErrorKind::Tls,
        ureq::ErrorKind::ConnectionFailed => match io_error_kind(&error) {
            Some(std::io::ErrorKind::TimedOut) => TransportErrorKind::ConnectTimeout,
            _ => TransportErrorKind::Connect,
        },
        ureq::ErrorKind::Io if is_tls_failure(&error) => TransportErrorKind::Tls,
        ureq::ErrorKind::Io => exchange_failure_kind(io_error_kind(&error)),
        _ => TransportErrorKind::Io,
    };
    TransportError::new(kind, error).into()
}

impl fmt::Debug for UreqTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UreqTransport")
            .field("ownership", &self.ownership)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl BlockingTransport for UreqTransport {
    fn open(&self) -> Result<(), PipelineError> {
        let mut state = self.state.lock();
        if state.agent.is_none() {
            state.agent = Some(build_agent(&self.config)?);
        }
        state.closed = false;
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        if self.ownership == PoolOwnership::Owned {
            state.agent = None;
        }
    }

    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, PipelineError> {
        check_scheme(request, self.config.allows_insecure_http())?;
        let agent = self.checkout()?;
        let _slot = self.in_flight.acquire();
        self.exchange(&agent, request)
    }
}
