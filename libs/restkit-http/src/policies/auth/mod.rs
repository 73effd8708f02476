//! Request authentication.
//!
//! Credentials are applied on every attempt and every redirect hop, so a
//! retried call is re-signed with a current token. Once a redirect leaves the
//! origin of the first request, credentials are only applied again for hosts
//! listed as trusted.

mod bearer;
mod sas;
mod secret;
mod shared_key;
mod token_cache;

#[cfg(test)]
pub use token_cache::testing;

use std::collections::BTreeSet;
use std::sync::Arc;

use http::HeaderValue;
use http::header::AUTHORIZATION;
use url::{Origin, Url};

pub use bearer::BearerTokenPolicy;
pub use sas::SasTokenPolicy;
pub use secret::Secret;
pub use shared_key::{SharedKeyCredential, SharedKeyPolicy};
pub use token_cache::{AccessToken, DEFAULT_REFRESH_MARGIN, TokenCache, TokenCredential};

use super::{BlockingNext, Next};
use crate::error::PipelineError;
use crate::message::Message;
use crate::request::HttpRequest;

/// Origin of the first authenticated request of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AuthOrigin(Origin);

#[derive(Debug, Clone)]
enum Scheme {
    Bearer(BearerTokenPolicy),
    Sas(SasTokenPolicy),
    SharedKey(SharedKeyPolicy),
}

/// Applies one credential scheme to outgoing requests.
///
/// ```ignore
/// let cache = Arc::new(TokenCache::new(credential));
/// let auth = AuthenticationPolicy::from(BearerTokenPolicy::new(cache, ["https://vault.example/.default"]))
///     .trusted_host("backup.vault.example");
/// ```
#[derive(Debug, Clone)]
pub struct AuthenticationPolicy {
    scheme: Scheme,
    trusted_hosts: Arc<BTreeSet<String>>,
}

impl AuthenticationPolicy {
    fn with_scheme(scheme: Scheme) -> Self {
        Self {
            scheme,
            trusted_hosts: Arc::default(),
        }
    }

    /// Keep authenticating when a redirect moves the call to `host`.
    #[must_use]
    pub fn trusted_host(mut self, host: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.trusted_hosts).insert(host.into().to_ascii_lowercase());
        self
    }

    pub(super) async fn send(
        &self,
        message: &mut Message,
        next: Next<'_>,
    ) -> Result<(), PipelineError> {
        if !self.applies_to(message) {
            return next.run(message).await;
        }
        match &self.scheme {
            Scheme::Bearer(policy) => {
                let token = policy.authorize(message).await?;
                next.run(message).await?;
                if policy.should_reauthorize(message, &token) {
                    message.take_response();
                    policy.authorize(message).await?;
                    next.run(message).await?;
                }
                Ok(())
            }
            Scheme::Sas(policy) => {
                policy.authorize(message.request_mut())?;
                next.run(message).await
            }
            Scheme::SharedKey(policy) => {
                policy.authorize(message.request_mut())?;
                next.run(message).await
            }
        }
    }

    pub(super) fn send_blocking(
        &self,
        message: &mut Message,
        next: BlockingNext<'_>,
    ) -> Result<(), PipelineError> {
        if !self.applies_to(message) {
            return next.run(message);
        }
        match &self.scheme {
            Scheme::Bearer(policy) => {
                let token = policy.authorize_blocking(message)?;
                next.run(message)?;
                if policy.should_reauthorize(message, &token) {
                    message.take_response();
                    policy.authorize_blocking(message)?;
                    next.run(message)?;
                }
                Ok(())
            }
            Scheme::Sas(policy) => {
                policy.authorize(message.request_mut())?;
                next.run(message)
            }
            Scheme::SharedKey(policy) => {
                policy.authorize(message.request_mut())?;
                next.run(message)
            }
        }
    }

    /// Whether credentials may be attached to the current request.
    fn applies_to(&self, message: &mut Message) -> bool {
        let url = message.request().url();
        let origin = url.origin();
        let Some(AuthOrigin(first)) = message.context().get::<AuthOrigin>() else {
            message.context_mut().insert(AuthOrigin(origin));
            return true;
        };
        if *first == origin || self.is_trusted(url) {
            return true;
        }
        tracing::debug!(
            host = url.host_str().unwrap_or_default(),
            "Not applying credentials to cross-origin request"
        );
        message.request_mut().headers_mut().remove(AUTHORIZATION);
        false
    }

    fn is_trusted(&self, url: &Url) -> bool {
        url.host_str()
            .is_some_and(|host| self.trusted_hosts.contains(&host.to_ascii_lowercase()))
    }
}

impl From<BearerTokenPolicy> for AuthenticationPolicy {
    fn from(policy: BearerTokenPolicy) -> Self {
        Self::with_scheme(Scheme::Bearer(policy))
    }
}

impl From<SasTokenPolicy> for AuthenticationPolicy {
    fn from(policy: SasTokenPolicy) -> Self {
        Self::with_scheme(Scheme::Sas(policy))
    }
}

impl From<SharedKeyPolicy> for AuthenticationPolicy {
    fn from(policy: SharedKeyPolicy) -> Self {
        Self::with_scheme(Scheme::SharedKey(policy))
    }
}

/// Credentials over plain HTTP are refused unless explicitly allowed.
fn require_https(request: &HttpRequest, allow_http: bool) -> Result<(), PipelineError> {
    if request.url().scheme() == "https" || allow_http {
        Ok(())
    } else {
        Err(PipelineError::InvalidRequest(
            "credentials require an https URL".to_owned(),
        ))
    }
}

/// Set `Authorization` as a sensitive header value.
fn set_authorization(request: &mut HttpRequest, credential: &str) -> Result<(), PipelineError> {
    let mut value = HeaderValue::from_str(credential)?;
    value.set_sensitive(true);
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(())
}
