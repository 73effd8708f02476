use std::fmt;
use std::sync::Arc;

use http::Method;
use url::Url;

use crate::config::{LoggingOptions, PipelineConfig, RedirectOptions, RetryOptions, TransportConfig};
use crate::error::PipelineError;
use crate::message::RequestOptions;
use crate::pipeline::{BlockingPipeline, Pipeline};
use crate::policies::{
    AuthenticationPolicy, BearerTokenPolicy, ContentDecodePolicy, CustomHookPolicy,
    HeadersPolicy, Hooks, LoggingPolicy, Policy, RedirectPolicy, RequestHook, ResponseHook,
    RetryPolicy, SansIoPolicy, TokenCache, TokenCredential, UserAgentPolicy,
};
use crate::request::HttpRequest;
use crate::response::PipelineResponse;
use crate::transport::{AsyncTransport, BlockingTransport, HyperTransport, UreqTransport};

enum AuthSetup {
    Policy(AuthenticationPolicy),
    Credential {
        credential: Arc<dyn TokenCredential>,
        scopes: Vec<String>,
    },
}

/// Builder for [`PipelineClient`] and [`BlockingPipelineClient`].
///
/// Unless a custom list is supplied with [`policies`](Self::policies), the
/// chain is assembled in this order:
///
/// `headers → user-agent → [per-call] → content-decode → retry → redirect →
/// authentication → [per-retry] → custom-hook → logging → transport`
///
/// Retry wraps redirect and authentication, so every attempt follows
/// redirects afresh and re-reads the (possibly refreshed) credential.
pub struct PipelineClientBuilder {
    config: PipelineConfig,
    base_url: Option<String>,
    auth: Option<AuthSetup>,
    per_call: Vec<Policy>,
    per_retry: Vec<Policy>,
    custom: Option<Vec<Policy>>,
    hooks: Hooks,
}

impl Default for PipelineClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineClientBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(PipelineConfig::default())
    }

    #[must_use]
    pub fn with_config(config: PipelineConfig) -> Self {
        Self {
            config,
            base_url: None,
            auth: None,
            per_call: Vec::new(),
            per_retry: Vec::new(),
            custom: None,
            hooks: Hooks::default(),
        }
    }

    /// Relative paths passed to the client are joined onto this URL.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Prefix for the `User-Agent` header.
    #[must_use]
    pub fn application_id(mut self, id: impl Into<String>) -> Self {
        self.config.application_id = Some(id.into());
        self
    }

    /// Add a default header sent on every request that does not set it.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryOptions) -> Self {
        self.config.retry = retry;
        self
    }

    #[must_use]
    pub fn redirect(mut self, redirect: RedirectOptions) -> Self {
        self.config.redirect = redirect;
        self
    }

    #[must_use]
    pub fn transport_config(mut self, transport: TransportConfig) -> Self {
        self.config.transport = transport;
        self
    }

    #[must_use]
    pub fn logging(mut self, logging: LoggingOptions) -> Self {
        self.config.logging = logging;
        self
    }

    /// Authenticate requests with a pre-built scheme (bearer, SAS or shared key).
    #[must_use]
    pub fn authentication(mut self, policy: impl Into<AuthenticationPolicy>) -> Self {
        self.auth = Some(AuthSetup::Policy(policy.into()));
        self
    }

    /// Authenticate with bearer tokens from `credential`.
    ///
    /// Tokens are cached per client using the configured refresh margin.
    /// Plain HTTP targets are accepted only when the transport allows
    /// insecure HTTP.
    #[must_use]
    pub fn token_credential<I, S>(mut self, credential: Arc<dyn TokenCredential>, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.auth = Some(AuthSetup::Credential {
            credential,
            scopes: scopes.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Add a policy that runs once per logical call, outside retry.
    #[must_use]
    pub fn per_call_policy(mut self, policy: impl SansIoPolicy + 'static) -> Self {
        self.per_call.push(Policy::user_defined(policy));
        self
    }

    /// Add a policy that runs on every attempt, inside retry.
    #[must_use]
    pub fn per_retry_policy(mut self, policy: impl SansIoPolicy + 'static) -> Self {
        self.per_retry.push(Policy::user_defined(policy));
        self
    }

    /// Replace the assembled chain with a fully custom ordered list.
    #[must_use]
    pub fn policies(mut self, policies: Vec<Policy>) -> Self {
        self.custom = Some(policies);
        self
    }

    #[must_use]
    pub fn raw_request_hook(mut self, hook: RequestHook) -> Self {
        self.hooks.on_request = Some(hook);
        self
    }

    #[must_use]
    pub fn raw_response_hook(mut self, hook: ResponseHook) -> Self {
        self.hooks.on_response = Some(hook);
        self
    }

    /// Build an async client over a hyper transport that owns its pool.
    ///
    /// # Errors
    /// Returns `PipelineError::Config` for an invalid base URL and
    /// `PipelineError::InvalidHeader` for an invalid default header or
    /// application id.
    pub fn build(self) -> Result<PipelineClient, PipelineError> {
        let transport = Arc::new(HyperTransport::new(self.config.transport.clone()));
        self.build_with_transport(transport)
    }

    /// Build an async client over the given transport.
    ///
    /// # Errors
    /// Returns `PipelineError::Config` for an invalid base URL and
    /// `PipelineError::InvalidHeader` for an invalid default header or
    /// application id.
    pub fn build_with_transport(
        self,
        transport: Arc<dyn AsyncTransport>,
    ) -> Result<PipelineClient, PipelineError> {
        let (base_url, policies) = self.assemble()?;
        Ok(PipelineClient {
            pipeline: Pipeline::new(policies, transport),
            base_url,
        })
    }

    /// Build a blocking client over a ureq transport that owns its agent.
    ///
    /// # Errors
    /// Returns `PipelineError::Config` for an invalid base URL and
    /// `PipelineError::InvalidHeader` for an invalid default header or
    /// application id.
    pub fn build_blocking(self) -> Result<BlockingPipelineClient, PipelineError> {
        let transport = Arc::new(UreqTransport::new(self.config.transport.clone()));
        self.build_blocking_with_transport(transport)
    }

    /// Build a blocking client over the given transport.
    ///
    /// # Errors
    /// Returns `PipelineError::Config` for an invalid base URL and
    /// `PipelineError::InvalidHeader` for an invalid default header or
    /// application id.
    pub fn build_blocking_with_transport(
        self,
        transport: Arc<dyn BlockingTransport>,
    ) -> Result<BlockingPipelineClient, PipelineError> {
        let (base_url, policies) = self.assemble()?;
        Ok(BlockingPipelineClient {
            pipeline: BlockingPipeline::new(policies, transport),
            base_url,
        })
    }

    fn assemble(self) -> Result<(Option<Url>, Vec<Policy>), PipelineError> {
        let base_url = self
            .base_url
            .as_deref()
            .map(|raw| {
                Url::parse(raw)
                    .map_err(|e| PipelineError::Config(format!("invalid base URL '{raw}': {e}")))
            })
            .transpose()?;

        if let Some(custom) = self.custom {
            return Ok((base_url, custom));
        }

        let config = self.config;
        let auth = self.auth.map(|setup| match setup {
            AuthSetup::Policy(policy) => policy,
            AuthSetup::Credential { credential, scopes } => {
                let cache = TokenCache::new(credential).with_refresh_margin(config.token_refresh_margin);
                BearerTokenPolicy::new(Arc::new(cache), scopes)
                    .allow_http(config.transport.allows_insecure_http())
                    .into()
            }
        });

        let mut policies = vec![
            Policy::Headers(HeadersPolicy::from_config(&config)?),
            Policy::UserAgent(UserAgentPolicy::try_new(config.application_id.as_deref())?),
        ];
        policies.extend(self.per_call);
        policies.push(Policy::ContentDecode(ContentDecodePolicy));
        policies.push(Policy::Retry(RetryPolicy::new(config.retry)));
        policies.push(Policy::Redirect(RedirectPolicy::new(config.redirect)));
        if let Some(auth) = auth {
            policies.push(Policy::Authentication(auth));
        }
        policies.extend(self.per_retry);
        policies.push(Policy::CustomHook(CustomHookPolicy::new(self.hooks)));
        policies.push(Policy::Logging(LoggingPolicy::new(&config.logging)));

        tracing::debug!(
            policies = policies.len(),
            base_url = base_url.as_ref().map_or("", Url::as_str),
            "pipeline client assembled"
        );
        Ok((base_url, policies))
    }
}

/// Resolve `path` against `base`.
///
/// Absolute URLs are used verbatim. Relative paths are appended to the base
/// path, so `"items"` and `"/items"` both land under a base of
/// `https://host/api`.
fn resolve(base: Option<&Url>, path: &str) -> Result<Url, PipelineError> {
    if let Ok(url) = Url::parse(path)
        && url.has_host()
    {
        return Ok(url);
    }
    let base = base.ok_or_else(|| {
        PipelineError::InvalidRequest(format!("relative path '{path}' needs a base URL"))
    })?;
    let mut directory = base.clone();
    if !directory.path().ends_with('/') {
        let with_slash = format!("{}/", directory.path());
        directory.set_path(&with_slash);
    }
    directory
        .join(path.trim_start_matches('/'))
        .map_err(|source| PipelineError::InvalidUrl {
            url: path.to_owned(),
            source,
        })
}

macro_rules! request_helpers {
    () => {
        #[must_use]
        pub fn base_url(&self) -> Option<&Url> {
            self.base_url.as_ref()
        }

        /// Join `path` onto the base URL; absolute URLs pass through.
        ///
        /// # Errors
        /// Returns `PipelineError::InvalidRequest` if `path` is relative and
        /// no base URL is configured, `PipelineError::InvalidUrl` if the join
        /// fails.
        pub fn format_url(&self, path: &str) -> Result<Url, PipelineError> {
            resolve(self.base_url.as_ref(), path)
        }

        /// # Errors
        /// See [`format_url`](Self::format_url).
        pub fn request(&self, method: Method, path: &str) -> Result<HttpRequest, PipelineError> {
            Ok(HttpRequest::new(method, self.format_url(path)?))
        }

        /// # Errors
        /// See [`format_url`](Self::format_url).
        pub fn get(&self, path: &str) -> Result<HttpRequest, PipelineError> {
            self.request(Method::GET, path)
        }

        /// # Errors
        /// See [`format_url`](Self::format_url).
        pub fn put(&self, path: &str) -> Result<HttpRequest, PipelineError> {
            self.request(Method::PUT, path)
        }

        /// # Errors
        /// See [`format_url`](Self::format_url).
        pub fn post(&self, path: &str) -> Result<HttpRequest, PipelineError> {
            self.request(Method::POST, path)
        }

        /// # Errors
        /// See [`format_url`](Self::format_url).
        pub fn patch(&self, path: &str) -> Result<HttpRequest, PipelineError> {
            self.request(Method::PATCH, path)
        }

        /// # Errors
        /// See [`format_url`](Self::format_url).
        pub fn delete(&self, path: &str) -> Result<HttpRequest, PipelineError> {
            self.request(Method::DELETE, path)
        }

        /// # Errors
        /// See [`format_url`](Self::format_url).
        pub fn head(&self, path: &str) -> Result<HttpRequest, PipelineError> {
            self.request(Method::HEAD, path)
        }
    };
}

/// Async client: a pipeline plus URL helpers.
///
/// `PipelineClient` is `Clone + Send + Sync`; clones share the pipeline and
/// the transport's connection pool.
///
/// ```ignore
/// let client = PipelineClient::builder()
///     .base_url("https://inventory.example.com/api/")
///     .token_credential(credential, ["inventory/.default"])
///     .build()?;
///
/// let items = client
///     .send(client.get("items")?, RequestOptions::new())
///     .await?
///     .error_for_status()?
///     .json::<Vec<Item>>()?;
/// ```
#[derive(Clone)]
pub struct PipelineClient {
    pipeline: Pipeline,
    base_url: Option<Url>,
}

impl PipelineClient {
    #[must_use]
    pub fn builder() -> PipelineClientBuilder {
        PipelineClientBuilder::new()
    }

    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    request_helpers!();

    /// Send `request` through the pipeline.
    ///
    /// Any status code is a successful send; use
    /// [`PipelineResponse::error_for_status`] to turn 4xx/5xx into errors.
    ///
    /// # Errors
    /// Returns the first error no policy recovered from.
    pub async fn send(
        &self,
        request: HttpRequest,
        options: RequestOptions,
    ) -> Result<PipelineResponse, PipelineError> {
        self.pipeline.run(request, options).await
    }

    /// # Errors
    /// Returns `PipelineError::Config` if the transport cannot build its pool.
    pub async fn open(&self) -> Result<(), PipelineError> {
        self.pipeline.open().await
    }

    pub async fn close(&self) {
        self.pipeline.close().await;
    }
}

impl fmt::Debug for PipelineClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineClient")
            .field("base_url", &self.base_url.as_ref().map(Url::as_str))
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

/// Blocking client: a blocking pipeline plus URL helpers.
#[derive(Clone)]
pub struct BlockingPipelineClient {
    pipeline: BlockingPipeline,
    base_url: Option<Url>,
}

impl BlockingPipelineClient {
    #[must_use]
    pub fn builder() -> PipelineClientBuilder {
        PipelineClientBuilder::new()
    }

    #[must_use]
    pub fn pipeline(&self) -> &BlockingPipeline {
        &self.pipeline
    }

    request_helpers!();

    /// # Errors
    /// Returns the first error no policy recovered from.
    pub fn send(
        &self,
        request: HttpRequest,
        options: RequestOptions,
    ) -> Result<PipelineResponse, PipelineError> {
        self.pipeline.run(request, options)
    }

    /// # Errors
    /// Returns `PipelineError::Config` if the transport cannot build its pool.
    pub fn open(&self) -> Result<(), PipelineError> {
        self.pipeline.open()
    }

    pub fn close(&self) {
        self.pipeline.close();
    }
}

impl fmt::Debug for BlockingPipelineClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingPipelineClient")
            .field("base_url", &self.base_url.as_ref().map(Url::as_str))
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::CredentialError;
    use crate::message::Message;
    use crate::policies::testing::MockTransport;
    use crate::policies::{AccessToken, SasTokenPolicy};
    use crate::response::HttpResponse;
    use async_trait::async_trait;
    use http::StatusCode;
    use http::header::{AUTHORIZATION, USER_AGENT};
    use parking_lot::Mutex;
    use std::ops::ControlFlow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counter {
        name: &'static str,
        hits: Arc<AtomicUsize>,
    }

    impl SansIoPolicy for Counter {
        fn on_request(&self, _message: &mut Message) -> Result<ControlFlow<HttpResponse>, PipelineError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(ControlFlow::Continue(()))
        }

        fn name(&self) -> &str {
            self.name
        }
    }

    fn counter(name: &'static str) -> (Counter, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        (
            Counter {
                name,
                hits: Arc::clone(&hits),
            },
            hits,
        )
    }

    struct StaticCredential;

    #[async_trait]
    impl TokenCredential for StaticCredential {
        async fn get_token(&self, _scopes: &[String]) -> Result<AccessToken, CredentialError> {
            Ok(AccessToken::expires_in("abc", Duration::from_secs(3600)))
        }
    }

    fn testing_builder() -> PipelineClientBuilder {
        PipelineClientBuilder::with_config(PipelineConfig::for_testing())
            .base_url("https://example.com/api")
    }

    #[test]
    fn test_policies_are_assembled_in_canonical_order() {
        let (per_call, _) = counter("per_call");
        let (per_retry, _) = counter("per_retry");
        let client = testing_builder()
            .per_call_policy(per_call)
            .per_retry_policy(per_retry)
            .authentication(SasTokenPolicy::new("sig=1"))
            .build_with_transport(Arc::new(MockTransport::statuses(&[200])))
            .unwrap();

        let names: Vec<&str> = client.pipeline().policies().iter().map(Policy::name).collect();
        assert_eq!(
            names,
            [
                "headers",
                "user_agent",
                "per_call",
                "content_decode",
                "retry",
                "redirect",
                "authentication",
                "per_retry",
                "custom_hook",
                "logging"
            ]
        );
    }

    #[test]
    fn test_custom_policy_list_replaces_defaults() {
        let client = testing_builder()
            .policies(vec![Policy::ContentDecode(ContentDecodePolicy)])
            .build_with_transport(Arc::new(MockTransport::statuses(&[200])))
            .unwrap();
        assert_eq!(client.pipeline().policies().len(), 1);
    }

    #[tokio::test]
    async fn test_per_call_runs_once_and_per_retry_every_attempt() {
        let (per_call, call_hits) = counter("per_call");
        let (per_retry, retry_hits) = counter("per_retry");
        let transport = Arc::new(MockTransport::statuses(&[503, 503, 200]));
        let client = testing_builder()
            .per_call_policy(per_call)
            .per_retry_policy(per_retry)
            .build_with_transport(transport.clone())
            .unwrap();

        let response = client
            .send(client.get("items").unwrap(), RequestOptions::new())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(transport.attempts(), 3);
        assert_eq!(call_hits.load(Ordering::SeqCst), 1);
        assert_eq!(retry_hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_default_headers_user_agent_and_bearer_token() {
        let transport = Arc::new(MockTransport::statuses(&[200]));
        let client = testing_builder()
            .application_id("inventory-sync/2.1")
            .header("x-tenant", "contoso")
            .token_credential(Arc::new(StaticCredential), ["inventory/.default"])
            .build_with_transport(transport.clone())
            .unwrap();

        client
            .send(client.get("items").unwrap(), RequestOptions::new())
            .await
            .unwrap();

        let sent = &transport.requests()[0];
        assert_eq!(sent.headers()["x-tenant"], "contoso");
        assert_eq!(sent.headers()[AUTHORIZATION], "Bearer abc");
        assert!(sent.headers()[AUTHORIZATION].is_sensitive());
        assert!(
            sent.headers()[USER_AGENT]
                .to_str()
                .unwrap()
                .starts_with("inventory-sync/2.1 restkit-http/")
        );
        assert!(sent.headers().contains_key("x-ms-client-request-id"));
    }

    #[tokio::test]
    async fn test_client_hook_is_replaced_by_call_hook() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let client_seen = Arc::clone(&seen);
        let call_seen = Arc::clone(&seen);
        let client = testing_builder()
            .raw_request_hook(Arc::new(move |request: &HttpRequest| {
                client_seen.lock().push(format!("client {}", request.url().path()));
            }))
            .build_with_transport(Arc::new(MockTransport::statuses(&[200])))
            .unwrap();

        client
            .send(client.get("a").unwrap(), RequestOptions::new())
            .await
            .unwrap();
        client
            .send(
                client.get("b").unwrap(),
                RequestOptions::new().raw_request_hook(Arc::new(move |request: &HttpRequest| {
                    call_seen.lock().push(format!("call {}", request.url().path()));
                })),
            )
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec!["client /api/a", "call /api/b"]);
    }

    #[test]
    fn test_format_url() {
        let client = testing_builder()
            .build_with_transport(Arc::new(MockTransport::statuses(&[200])))
            .unwrap();

        assert_eq!(
            client.format_url("items/1").unwrap().as_str(),
            "https://example.com/api/items/1"
        );
        assert_eq!(
            client.format_url("/items?top=5").unwrap().as_str(),
            "https://example.com/api/items?top=5"
        );
        assert_eq!(
            client.format_url("https://other.example.net/x").unwrap().as_str(),
            "https://other.example.net/x"
        );
        assert_eq!(client.head("items").unwrap().method(), &Method::HEAD);
    }

    #[test]
    fn test_relative_path_without_base_url_is_rejected() {
        let client = PipelineClientBuilder::with_config(PipelineConfig::for_testing())
            .build_with_transport(Arc::new(MockTransport::statuses(&[200])))
            .unwrap();
        assert!(matches!(
            client.get("items"),
            Err(PipelineError::InvalidRequest(_))
        ));
        assert!(client.base_url().is_none());
    }

    #[test]
    fn test_invalid_base_url_fails_build() {
        let err = PipelineClientBuilder::new()
            .base_url("not a url")
            .build_with_transport(Arc::new(MockTransport::statuses(&[200])))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_blocking_client_sends_through_chain() {
        let transport = Arc::new(MockTransport::statuses(&[502, 200]));
        let client = testing_builder()
            .build_blocking_with_transport(transport.clone())
            .unwrap();

        let response = client
            .send(client.delete("items/7").unwrap(), RequestOptions::new())
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(transport.attempts(), 2);
        assert_eq!(transport.requests()[1].url().path(), "/api/items/7");
    }
}
