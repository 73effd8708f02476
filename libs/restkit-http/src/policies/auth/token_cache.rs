//! Shared access-token cache with coalesced refresh.
//!
//! One slot per scope set. While a refresh is in flight every caller for
//! that slot awaits the same shared future, so a cold or expired cache
//! costs exactly one acquisition no matter how many calls are waiting.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;

use super::secret::Secret;
use crate::error::CredentialError;

/// Default time before expiry at which a cached token is refreshed.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// A bearer token and the instant it stops being valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    token: Secret,
    expires_at: SystemTime,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_at: SystemTime) -> Self {
        Self {
            token: Secret::new(token),
            expires_at,
        }
    }

    /// Token valid for `ttl` from now.
    pub fn expires_in(token: impl Into<String>, ttl: Duration) -> Self {
        Self::new(token, SystemTime::now() + ttl)
    }

    #[must_use]
    pub fn secret(&self) -> &str {
        self.token.expose()
    }

    #[must_use]
    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    /// Whether the token is still usable at `now` with `margin` to spare.
    #[must_use]
    pub fn is_fresh(&self, margin: Duration, now: SystemTime) -> bool {
        now.checked_add(margin)
            .is_some_and(|horizon| horizon < self.expires_at)
    }
}

/// Source of access tokens.
///
/// The cache treats implementations as opaque: it only calls `get_token`
/// and reads the returned expiry.
#[async_trait]
pub trait TokenCredential: Send + Sync {
    /// Acquire a new token for `scopes`.
    ///
    /// # Errors
    /// Returns `CredentialError` if no token can be obtained.
    async fn get_token(&self, scopes: &[String]) -> Result<AccessToken, CredentialError>;
}

type Refresh = Shared<BoxFuture<'static, Result<AccessToken, CredentialError>>>;

#[derive(Default)]
struct Slot {
    token: Option<AccessToken>,
    refresh: Option<(u64, Refresh)>,
}

/// Token cache owned by the caller and shared across pipelines via `Arc`.
pub struct TokenCache {
    credential: Arc<dyn TokenCredential>,
    refresh_margin: Duration,
    slots: Mutex<HashMap<String, Slot>>,
    generation: AtomicU64,
}

impl TokenCache {
    pub fn new(credential: Arc<dyn TokenCredential>) -> Self {
        Self {
            credential,
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            slots: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    #[must_use]
    pub fn refresh_margin(&self) -> Duration {
        self.refresh_margin
    }

    /// Cached token for `scopes`, refreshing it when missing or close to
    /// expiry.
    ///
    /// Dropping the returned future does not abort a refresh other callers
    /// are waiting on.
    ///
    /// # Errors
    /// Returns the credential's error. Every caller that joined the failed
    /// refresh sees the same error; the next call starts a new refresh.
    pub async fn get_token(&self, scopes: &[String]) -> Result<AccessToken, CredentialError> {
        let key = scopes.join(" ");
        let (id, refresh) = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.clone()).or_default();
            if let Some(token) = &slot.token
                && token.is_fresh(self.refresh_margin, SystemTime::now())
            {
                return Ok(token.clone());
            }
            match &slot.refresh {
                Some((id, refresh)) => (*id, refresh.clone()),
                None => {
                    let id = self.generation.fetch_add(1, Ordering::Relaxed);
                    let refresh = self.start_refresh(scopes);
                    slot.refresh = Some((id, refresh.clone()));
                    tracing::debug!(scopes = %key, "Refreshing access token");
                    (id, refresh)
                }
            }
        };

        let result = refresh.await;

        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&key)
            && slot.refresh.as_ref().is_some_and(|(current, _)| *current == id)
        {
            slot.refresh = None;
            match &result {
                Ok(token) => slot.token = Some(token.clone()),
                Err(err) => tracing::warn!(scopes = %key, error = %err, "Access token refresh failed"),
            }
        }
        result
    }

    /// Blocking variant of [`get_token`](Self::get_token).
    ///
    /// Runs the credential on the calling thread, so the credential must not
    /// depend on an async runtime being present.
    ///
    /// # Errors
    /// Same as [`get_token`](Self::get_token).
    pub fn get_token_blocking(&self, scopes: &[String]) -> Result<AccessToken, CredentialError> {
        futures::executor::block_on(self.get_token(scopes))
    }

    /// Forget `token` if it is still the cached one for `scopes`.
    ///
    /// Used when the server rejects a token before its advertised expiry.
    pub fn invalidate(&self, scopes: &[String], token: &AccessToken) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&scopes.join(" "))
            && slot.token.as_ref() == Some(token)
        {
            slot.token = None;
        }
    }

    /// Drop every cached token.
    pub fn clear(&self) {
        for slot in self.slots.lock().values_mut() {
            slot.token = None;
        }
    }

    fn start_refresh(&self, scopes: &[String]) -> Refresh {
        let credential = Arc::clone(&self.credential);
        let scopes = scopes.to_vec();
        let refresh: BoxFuture<'static, _> =
            Box::pin(async move { credential.get_token(&scopes).await });
        refresh.shared()
    }
}

impl fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("refresh_margin", &self.refresh_margin)
            .field("slots", &self.slots.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub mod testing {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Credential that counts acquisitions and takes `delay` to answer.
    pub struct CountingCredential {
        pub calls: AtomicUsize,
        pub delay: Duration,
        pub ttl: Duration,
        pub fail_first: bool,
    }

    impl CountingCredential {
        pub fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
                ttl: Duration::from_secs(3600),
                fail_first: false,
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenCredential for CountingCredential {
        async fn get_token(&self, scopes: &[String]) -> Result<AccessToken, CredentialError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_first && call == 1 {
                return Err(CredentialError::Unavailable("identity endpoint down".to_owned()));
            }
            Ok(AccessToken::expires_in(
                format!("token-{call}-{}", scopes.join(",")),
                self.ttl,
            ))
        }
    }
}
