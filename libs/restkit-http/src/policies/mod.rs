//! Policy chain.
//!
//! A pipeline is an ordered slice of [`Policy`] values terminated by a
//! transport. Each policy receives the [`Message`] and a [`Next`] handle to
//! the remainder of the chain; calling [`Next::run`] continues with the next
//! policy (or the transport when the slice is exhausted).
//!
//! Most policies only look at the request on the way in and the response on
//! the way out; they implement [`SansIoPolicy`]. Retry, redirect and
//! authentication need to drive the inner chain themselves (several times,
//! or after a suspension point) and are dispatched directly.

mod auth;
mod content_decode;
mod custom_hook;
mod headers;
mod logging;
mod redirect;
mod retry;
mod user_agent;

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use futures::future::BoxFuture;

pub use auth::{
    AccessToken, AuthenticationPolicy, BearerTokenPolicy, DEFAULT_REFRESH_MARGIN, SasTokenPolicy,
    Secret, SharedKeyCredential, SharedKeyPolicy, TokenCache, TokenCredential,
};
pub use content_decode::{ContentDecodePolicy, DecodedBody, decode_body};
pub use custom_hook::{CustomHookPolicy, Hooks, RequestHook, ResponseHook};
pub use headers::{CallHeaders, HeadersPolicy};
pub use logging::LoggingPolicy;
pub use redirect::{RedirectPolicy, RedirectState};
pub use retry::{RETRY_ATTEMPT_HEADER, RetryAttempt, RetryPolicy, backoff_delay};
pub use user_agent::{UserAgentPolicy, default_user_agent};

use crate::error::PipelineError;
use crate::message::Message;
use crate::response::HttpResponse;
use crate::transport::{AsyncTransport, BlockingTransport};

/// A policy that only observes or mutates the message around the inner call.
///
/// The same implementation serves blocking and async pipelines.
///
/// ```ignore
/// #[derive(Debug)]
/// struct TenantHeader(HeaderValue);
///
/// impl SansIoPolicy for TenantHeader {
///     fn on_request(&self, message: &mut Message) -> Result<ControlFlow<HttpResponse>, PipelineError> {
///         message.request_mut().headers_mut().insert("x-tenant", self.0.clone());
///         Ok(ControlFlow::Continue(()))
///     }
/// }
/// ```
pub trait SansIoPolicy: Send + Sync {
    /// Called before the inner chain runs.
    ///
    /// Returning `ControlFlow::Break(response)` short-circuits the chain:
    /// inner policies and the transport are skipped and `response` becomes
    /// the call's response.
    ///
    /// # Errors
    /// An error aborts the call and propagates to outer policies.
    fn on_request(&self, _message: &mut Message) -> Result<ControlFlow<HttpResponse>, PipelineError> {
        Ok(ControlFlow::Continue(()))
    }

    /// Called after the inner chain produced a response.
    ///
    /// # Errors
    /// An error replaces the response as the call's outcome.
    fn on_response(&self, _message: &mut Message) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Called when the inner chain failed. The returned error propagates;
    /// returning `error` unchanged passes the failure through.
    fn on_exception(&self, _message: &Message, error: PipelineError) -> PipelineError {
        error
    }

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// One link of the chain.
#[derive(Clone)]
#[non_exhaustive]
pub enum Policy {
    Headers(HeadersPolicy),
    UserAgent(UserAgentPolicy),
    Authentication(AuthenticationPolicy),
    ContentDecode(ContentDecodePolicy),
    Redirect(RedirectPolicy),
    Retry(RetryPolicy),
    CustomHook(CustomHookPolicy),
    Logging(LoggingPolicy),
    UserDefined(Arc<dyn SansIoPolicy>),
}

impl Policy {
    /// Wrap a user-defined policy.
    pub fn user_defined(policy: impl SansIoPolicy + 'static) -> Self {
        Self::UserDefined(Arc::new(policy))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Headers(_) => "headers",
            Self::UserAgent(_) => "user_agent",
            Self::Authentication(_) => "authentication",
            Self::ContentDecode(_) => "content_decode",
            Self::Redirect(_) => "redirect",
            Self::Retry(_) => "retry",
            Self::CustomHook(_) => "custom_hook",
            Self::Logging(_) => "logging",
            Self::UserDefined(policy) => policy.name(),
        }
    }

    fn as_sans_io(&self) -> Option<&dyn SansIoPolicy> {
        match self {
            Self::Headers(policy) => Some(policy),
            Self::UserAgent(policy) => Some(policy),
            Self::ContentDecode(policy) => Some(policy),
            Self::CustomHook(policy) => Some(policy),
            Self::Logging(policy) => Some(policy),
            Self::UserDefined(policy) => Some(policy.as_ref()),
            Self::Authentication(_) | Self::Redirect(_) | Self::Retry(_) => None,
        }
    }

    async fn send(&self, message: &mut Message, next: Next<'_>) -> Result<(), PipelineError> {
        match self {
            Self::Authentication(policy) => policy.send(message, next).await,
            Self::Redirect(policy) => policy.send(message, next).await,
            Self::Retry(policy) => policy.send(message, next).await,
            other => match other.as_sans_io() {
                Some(policy) => run_sans_io(policy, message, next).await,
                None => next.run(message).await,
            },
        }
    }

    fn send_blocking(
        &self,
        message: &mut Message,
        next: BlockingNext<'_>,
    ) -> Result<(), PipelineError> {
        match self {
            Self::Authentication(policy) => policy.send_blocking(message, next),
            Self::Redirect(policy) => policy.send_blocking(message, next),
            Self::Retry(policy) => policy.send_blocking(message, next),
            other => match other.as_sans_io() {
                Some(policy) => run_sans_io_blocking(policy, message, next),
                None => next.run(message),
            },
        }
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Policy").field(&self.name()).finish()
    }
}

async fn run_sans_io(
    policy: &dyn SansIoPolicy,
    message: &mut Message,
    next: Next<'_>,
) -> Result<(), PipelineError> {
    if let ControlFlow::Break(response) = policy.on_request(message)? {
        message.set_response(response);
        return Ok(());
    }
    if let Err(error) = next.run(message).await {
        return Err(policy.on_exception(message, error));
    }
    policy.on_response(message)
}

fn run_sans_io_blocking(
    policy: &dyn SansIoPolicy,
    message: &mut Message,
    next: BlockingNext<'_>,
) -> Result<(), PipelineError> {
    if let ControlFlow::Break(response) = policy.on_request(message)? {
        message.set_response(response);
        return Ok(());
    }
    if let Err(error) = next.run(message) {
        return Err(policy.on_exception(message, error));
    }
    policy.on_response(message)
}

/// The remainder of an async chain.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    policies: &'a [Policy],
    transport: &'a dyn AsyncTransport,
}

impl<'a> Next<'a> {
    pub(crate) fn new(policies: &'a [Policy], transport: &'a dyn AsyncTransport) -> Self {
        Self {
            policies,
            transport,
        }
    }

    /// Run the rest of the chain, storing the response on `message`.
    pub fn run<'m>(self, message: &'m mut Message) -> BoxFuture<'m, Result<(), PipelineError>>
    where
        'a: 'm,
    {
        Box::pin(async move {
            match self.policies.split_first() {
                Some((policy, rest)) => policy.send(message, Next::new(rest, self.transport)).await,
                None => {
                    let control = message.control().clone();
                    let response = control.guard(self.transport.send(message.request())).await?;
                    message.set_response(response);
                    Ok(())
                }
            }
        })
    }
}

/// The remainder of a blocking chain.
#[derive(Clone, Copy)]
pub struct BlockingNext<'a> {
    policies: &'a [Policy],
    transport: &'a dyn BlockingTransport,
}

impl<'a> BlockingNext<'a> {
    pub(crate) fn new(policies: &'a [Policy], transport: &'a dyn BlockingTransport) -> Self {
        Self {
            policies,
            transport,
        }
    }

    /// Run the rest of the chain, storing the response on `message`.
    ///
    /// # Errors
    /// Returns the first error not handled by an inner policy.
    pub fn run(self, message: &mut Message) -> Result<(), PipelineError> {
        match self.policies.split_first() {
            Some((policy, rest)) => {
                policy.send_blocking(message, BlockingNext::new(rest, self.transport))
            }
            None => {
                message.control().check()?;
                let response = self.transport.send(message.request())?;
                message.set_response(response);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
pub mod testing;
