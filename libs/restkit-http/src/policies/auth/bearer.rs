use std::sync::Arc;

use http::StatusCode;
use zeroize::Zeroizing;

use super::{AccessToken, TokenCache, require_https, set_authorization};
use crate::error::PipelineError;
use crate::message::Message;

/// `Authorization: Bearer <token>` from a shared [`TokenCache`].
#[derive(Debug, Clone)]
pub struct BearerTokenPolicy {
    cache: Arc<TokenCache>,
    scopes: Vec<String>,
    allow_http: bool,
}

impl BearerTokenPolicy {
    pub fn new<I, S>(cache: Arc<TokenCache>, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cache,
            scopes: scopes.into_iter().map(Into::into).collect(),
            allow_http: false,
        }
    }

    /// Permit sending the token over plain HTTP (local emulators only).
    #[must_use]
    pub fn allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }

    #[must_use]
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub(super) async fn authorize(&self, message: &mut Message) -> Result<AccessToken, PipelineError> {
        require_https(message.request(), self.allow_http)?;
        let control = message.control().clone();
        let token = control
            .guard(async {
                self.cache
                    .get_token(&self.scopes)
                    .await
                    .map_err(PipelineError::from)
            })
            .await?;
        apply(message, &token)?;
        Ok(token)
    }

    pub(super) fn authorize_blocking(&self, message: &mut Message) -> Result<AccessToken, PipelineError> {
        require_https(message.request(), self.allow_http)?;
        message.control().check()?;
        let token = self.cache.get_token_blocking(&self.scopes)?;
        apply(message, &token)?;
        Ok(token)
    }

    /// A 401 means the server no longer accepts `token`; drop it from the
    /// cache and ask for one more attempt if the body can be sent again.
    pub(super) fn should_reauthorize(&self, message: &Message, token: &AccessToken) -> bool {
        let rejected = message
            .response()
            .is_some_and(|response| response.status() == StatusCode::UNAUTHORIZED);
        if !rejected {
            return false;
        }
        self.cache.invalidate(&self.scopes, token);
        let replayable = message.request().body().can_replay();
        tracing::debug!(replayable, "Bearer token rejected, refreshing");
        replayable
    }
}

fn apply(message: &mut Message, token: &AccessToken) -> Result<(), PipelineError> {
    let raw = Zeroizing::new(format!("Bearer {}", token.secret()));
    set_authorization(message.request_mut(), &raw)
}
