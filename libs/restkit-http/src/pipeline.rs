//! Pipelines: an immutable policy chain bound to a transport.

use std::fmt;
use std::sync::Arc;

use tracing::Instrument;
use url::Url;

use crate::error::PipelineError;
use crate::message::{Message, RequestOptions};
use crate::policies::{BlockingNext, Next, Policy};
use crate::request::HttpRequest;
use crate::response::PipelineResponse;
use crate::transport::{AsyncTransport, BlockingTransport};

/// URL as it appears on the call span: no credentials, no query, no fragment.
fn span_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_password(None).ok();
    url.set_username("").ok();
    url.set_query(None);
    url.set_fragment(None);
    url.into()
}

fn call_span(request: &HttpRequest) -> tracing::Span {
    tracing::debug_span!(
        "pipeline_call",
        http.method = %request.method(),
        http.url = %span_url(request.url()),
    )
}

/// Async pipeline.
///
/// Cloning is cheap; clones share the policies and the transport. Running a
/// call never mutates the pipeline, so one instance serves any number of
/// concurrent calls.
#[derive(Clone)]
pub struct Pipeline {
    policies: Arc<[Policy]>,
    transport: Arc<dyn AsyncTransport>,
}

impl Pipeline {
    #[must_use]
    pub fn new(policies: Vec<Policy>, transport: Arc<dyn AsyncTransport>) -> Self {
        Self {
            policies: policies.into(),
            transport,
        }
    }

    /// Policies in execution order, outermost first.
    #[must_use]
    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    /// Run one logical call through the chain.
    ///
    /// # Errors
    /// Returns the first error no policy recovered from.
    pub async fn run(
        &self,
        request: HttpRequest,
        options: RequestOptions,
    ) -> Result<PipelineResponse, PipelineError> {
        let span = call_span(&request);
        async move {
            let mut message = Message::with_options(request, options);
            Next::new(&self.policies, self.transport.as_ref())
                .run(&mut message)
                .await?;
            message.into_pipeline_response()
        }
        .instrument(span)
        .await
    }

    /// # Errors
    /// Returns `PipelineError::Config` if the transport cannot build its pool.
    pub async fn open(&self) -> Result<(), PipelineError> {
        self.transport.open().await
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("policies", &self.policies)
            .finish_non_exhaustive()
    }
}

/// Blocking pipeline; the same chain driven on the caller's thread.
#[derive(Clone)]
pub struct BlockingPipeline {
    policies: Arc<[Policy]>,
    transport: Arc<dyn BlockingTransport>,
}

impl BlockingPipeline {
    #[must_use]
    pub fn new(policies: Vec<Policy>, transport: Arc<dyn BlockingTransport>) -> Self {
        Self {
            policies: policies.into(),
            transport,
        }
    }

    #[must_use]
    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    /// Run one logical call through the chain.
    ///
    /// # Errors
    /// Returns the first error no policy recovered from.
    pub fn run(
        &self,
        request: HttpRequest,
        options: RequestOptions,
    ) -> Result<PipelineResponse, PipelineError> {
        let span = call_span(&request);
        let _entered = span.enter();
        let mut message = Message::with_options(request, options);
        BlockingNext::new(&self.policies, self.transport.as_ref()).run(&mut message)?;
        message.into_pipeline_response()
    }

    /// # Errors
    /// Returns `PipelineError::Config` if the transport cannot build its pool.
    pub fn open(&self) -> Result<(), PipelineError> {
        self.transport.open()
    }

    pub fn close(&self) {
        self.transport.close();
    }
}

impl fmt::Debug for BlockingPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingPipeline")
            .field("policies", &self.policies)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::RetryOptions;
    use crate::policies::testing::{MockTransport, get_request};
    use crate::policies::{LoggingPolicy, RetryPolicy};
    use http::StatusCode;
    use tracing_test::traced_test;

    #[test]
    fn test_span_url_drops_query_and_credentials() {
        let url = Url::parse("https://me:pw@example.com/items/1?sig=abc#top").unwrap();
        assert_eq!(span_url(&url), "https://example.com/items/1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_options_apply_to_one_call_only() {
        let transport = Arc::new(MockTransport::statuses(&[503, 503, 200]));
        let pipeline = Pipeline::new(
            vec![Policy::Retry(RetryPolicy::new(RetryOptions::for_testing()))],
            transport.clone(),
        );

        let first = pipeline
            .run(
                get_request(),
                RequestOptions::new().retry(RetryOptions::no_retries()),
            )
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(transport.attempts(), 1);

        let second = pipeline
            .run(get_request(), RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(transport.attempts(), 3);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_call_runs_inside_span() {
        let pipeline = Pipeline::new(
            vec![Policy::Logging(LoggingPolicy::default())],
            Arc::new(MockTransport::statuses(&[200])),
        );

        pipeline
            .run(
                get_request().with_query("sig", "secret"),
                RequestOptions::new(),
            )
            .await
            .unwrap();

        assert!(logs_contain("pipeline_call"));
        assert!(logs_contain("http.url=https://example.com/items"));
        assert!(!logs_contain("sig=secret"));
    }

    #[tokio::test]
    async fn test_concurrent_calls_share_one_pipeline() {
        let transport = Arc::new(MockTransport::statuses(&[200]));
        let pipeline = Pipeline::new(Vec::new(), transport.clone());

        let calls = (0..8).map(|_| pipeline.run(get_request(), RequestOptions::new()));
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(transport.attempts(), 8);
    }

    #[test]
    fn test_blocking_pipeline_runs_chain() {
        let transport = Arc::new(MockTransport::statuses(&[500, 200]));
        let pipeline = BlockingPipeline::new(
            vec![Policy::Retry(RetryPolicy::new(RetryOptions::for_testing()))],
            transport.clone(),
        );

        let response = pipeline.run(get_request(), RequestOptions::new()).unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(transport.attempts(), 2);
        assert_eq!(pipeline.policies().len(), 1);
    }
}
