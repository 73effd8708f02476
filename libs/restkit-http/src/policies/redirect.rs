//! Redirect following with cross-origin protections.
//!
//! - `Authorization`, `Cookie` and `Proxy-Authorization` never cross origins
//! - HTTPS to HTTP downgrades are refused unless explicitly allowed
//! - the number of hops per call is capped

use http::header::{self, HeaderName};
use http::{Method, StatusCode};
use url::Url;

use super::{BlockingNext, Next};
use crate::config::RedirectOptions;
use crate::error::PipelineError;
use crate::message::Message;
use crate::request::{HttpRequest, RequestBody};

/// Headers that are stripped on cross-origin redirects to prevent credential leakage
const SENSITIVE_HEADERS: &[HeaderName] = &[
    header::AUTHORIZATION,
    header::COOKIE,
    header::PROXY_AUTHORIZATION,
];

/// Entity headers dropped together with the body when the method changes to GET
const CONTENT_HEADERS: &[HeaderName] = &[
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CONTENT_ENCODING,
    header::CONTENT_LANGUAGE,
    header::CONTENT_LOCATION,
];

/// Redirect progress of the current call, visible to inner policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedirectState {
    /// Redirects followed so far
    pub hops: usize,
    /// Whether any hop left the origin of the first request
    pub cross_origin: bool,
}

/// Follows 301/302/303/307/308 responses that carry a `Location` header.
#[derive(Debug, Clone, Default)]
pub struct RedirectPolicy {
    options: RedirectOptions,
}

impl RedirectPolicy {
    #[must_use]
    pub fn new(options: RedirectOptions) -> Self {
        Self { options }
    }

    pub(super) async fn send(
        &self,
        message: &mut Message,
        next: Next<'_>,
    ) -> Result<(), PipelineError> {
        let options = self.effective(message);
        let mut state = RedirectState::default();
        message.context_mut().remove::<RedirectState>();
        loop {
            next.run(message).await?;
            match next_hop(&options, &mut state, message)? {
                Some(request) => begin_hop(message, request, state),
                None => return Ok(()),
            }
        }
    }

    pub(super) fn send_blocking(
        &self,
        message: &mut Message,
        next: BlockingNext<'_>,
    ) -> Result<(), PipelineError> {
        let options = self.effective(message);
        let mut state = RedirectState::default();
        message.context_mut().remove::<RedirectState>();
        loop {
            next.run(message)?;
            match next_hop(&options, &mut state, message)? {
                Some(request) => begin_hop(message, request, state),
                None => return Ok(()),
            }
        }
    }

    fn effective(&self, message: &Message) -> RedirectOptions {
        message
            .context()
            .get::<RedirectOptions>()
            .unwrap_or(&self.options)
            .clone()
    }
}

fn begin_hop(message: &mut Message, request: HttpRequest, state: RedirectState) {
    message.take_response();
    message.replace_request(request);
    message.context_mut().insert(state);
}

/// Check if two URLs share scheme, host and port.
fn is_same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Whether the redirect turns the request into a body-less GET.
fn downgrades_to_get(status: StatusCode, method: &Method) -> bool {
    match status {
        StatusCode::SEE_OTHER => *method != Method::HEAD,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => *method == Method::POST,
        _ => false,
    }
}

/// Whether the downgrade and origin rules let the call follow `target`.
fn hop_allowed(options: &RedirectOptions, current: &Url, target: &Url, same_origin: bool) -> bool {
    if !options.allow_https_downgrade && current.scheme() == "https" && target.scheme() == "http" {
        tracing::warn!(
            original = %current,
            target = %target,
            "Blocking HTTPS to HTTP downgrade redirect"
        );
        return false;
    }

    let allowed_host = target
        .host_str()
        .is_some_and(|host| options.allowed_redirect_hosts.contains(host));
    if options.same_origin_only && !same_origin && !allowed_host {
        tracing::warn!(
            original = %current,
            target = %target,
            "Blocking cross-origin redirect (same_origin_only=true)"
        );
        return false;
    }
    true
}

/// Build the request for the next hop, or `None` to return the current
/// response to the caller.
fn next_hop(
    options: &RedirectOptions,
    state: &mut RedirectState,
    message: &Message,
) -> Result<Option<HttpRequest>, PipelineError> {
    if !options.allow_redirects {
        return Ok(None);
    }
    let Some(response) = message.response() else {
        return Ok(None);
    };
    let status = response.status();
    if !is_redirect(status) {
        return Ok(None);
    }
    let Some(location) = response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
    else {
        return Ok(None);
    };

    let current = message.request();
    let target = match current.url().join(location) {
        Ok(target) => target,
        Err(err) => {
            tracing::warn!(location, error = %err, "Ignoring redirect with invalid Location");
            return Ok(None);
        }
    };

    if state.hops >= options.max_redirects {
        tracing::debug!(
            count = state.hops,
            max = options.max_redirects,
            "Redirect limit reached"
        );
        return Err(PipelineError::TooManyRedirects {
            max_redirects: options.max_redirects,
            response: Box::new(response.clone()),
        });
    }

    let same_origin = is_same_origin(current.url(), &target);
    if !hop_allowed(options, current.url(), &target, same_origin) {
        return Ok(None);
    }

    let mut request = current.clone();
    if downgrades_to_get(status, current.method()) {
        request.set_method(Method::GET);
        request.set_body(RequestBody::Empty);
        let headers = request.headers_mut();
        for name in CONTENT_HEADERS {
            headers.remove(name);
        }
    } else if !request.body().can_replay() {
        return Err(PipelineError::BodyNotReplayable { cause: None });
    }

    if !same_origin {
        state.cross_origin = true;
        tracing::debug!(
            original = %current.url(),
            target = %target,
            "Cross-origin redirect detected"
        );
    }
    if state.cross_origin && options.strip_sensitive_headers {
        let headers = request.headers_mut();
        for name in SENSITIVE_HEADERS {
            if headers.remove(name).is_some() {
                tracing::debug!(header = %name, "Stripped sensitive header on cross-origin redirect");
            }
        }
    }

    state.hops += 1;
    tracing::debug!(
        status = status.as_u16(),
        hop = state.hops,
        method = %request.method(),
        target_host = target.host_str().unwrap_or(""),
        "Following redirect"
    );
    request.set_url(target);
    Ok(Some(request))
}
