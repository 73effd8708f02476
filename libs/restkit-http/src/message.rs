//! Per-call state threaded through the policy chain.

use std::future::Future;
use std::time::Duration;

use http::{HeaderMap, HeaderName, HeaderValue};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{RedirectOptions, RetryOptions};
use crate::error::PipelineError;
use crate::policies::{CallHeaders, Hooks, RequestHook, ResponseHook};
use crate::request::HttpRequest;
use crate::response::{HttpResponse, PipelineResponse};

/// Granularity of cancellation checks while a blocking call sleeps.
const BLOCKING_SLEEP_SLICE: Duration = Duration::from_millis(20);

/// Typed values shared between policies for one call.
///
/// Values set by an outer policy are visible to every inner policy of the
/// same call and to nothing else.
#[derive(Debug, Clone, Default)]
pub struct Context {
    values: http::Extensions,
}

impl Context {
    /// Insert a value, returning the previous value of the same type.
    pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.values.insert(value)
    }

    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.values.get::<T>()
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.values.get_mut::<T>()
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.values.remove::<T>()
    }

    #[must_use]
    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.values.get::<T>().is_some()
    }
}

/// Cancellation and deadline for one logical call.
///
/// Checked at every suspension point: transport I/O, token refresh and
/// retry backoff.
#[derive(Debug, Clone, Default)]
pub struct CallControl {
    cancellation: Option<CancellationToken>,
    deadline: Option<(Instant, Duration)>,
}

impl CallControl {
    #[must_use]
    pub fn new(cancellation: Option<CancellationToken>, timeout: Option<Duration>) -> Self {
        Self {
            cancellation,
            // A budget past the end of the clock is no deadline at all.
            deadline: timeout.and_then(|budget| {
                Instant::now()
                    .checked_add(budget)
                    .map(|at| (at, budget))
            }),
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Time left before the deadline, if one is set.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|(at, _)| at.saturating_duration_since(Instant::now()))
    }

    /// Fail if the call was cancelled or its deadline passed.
    ///
    /// # Errors
    /// Returns `PipelineError::Cancelled` or `PipelineError::DeadlineExceeded`.
    pub fn check(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if let Some((at, budget)) = self.deadline
            && Instant::now() >= at
        {
            return Err(PipelineError::DeadlineExceeded(budget));
        }
        Ok(())
    }

    /// Drive `future` unless the call is cancelled or times out first.
    ///
    /// Dropping `future` aborts any I/O it had in flight.
    ///
    /// # Errors
    /// Returns the future's error, `PipelineError::Cancelled`, or
    /// `PipelineError::DeadlineExceeded`.
    pub async fn guard<T, F>(&self, future: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, PipelineError>>,
    {
        self.check()?;

        let cancelled = async {
            match &self.cancellation {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some((at, _)) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = cancelled => Err(PipelineError::Cancelled),
            () = expired => Err(self.deadline_error()),
            result = future => result,
        }
    }

    /// Sleep for `delay` honoring cancellation and the deadline.
    ///
    /// A delay that cannot finish before the deadline fails immediately.
    ///
    /// # Errors
    /// Returns `PipelineError::Cancelled` or `PipelineError::DeadlineExceeded`.
    pub async fn sleep(&self, delay: Duration) -> Result<(), PipelineError> {
        self.ensure_fits(delay)?;
        self.guard(async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await
    }

    /// Blocking variant of [`sleep`](Self::sleep).
    ///
    /// A delay too large to represent waits until the call is cancelled.
    ///
    /// # Errors
    /// Returns `PipelineError::Cancelled` or `PipelineError::DeadlineExceeded`.
    pub fn sleep_blocking(&self, delay: Duration) -> Result<(), PipelineError> {
        self.ensure_fits(delay)?;
        let until = std::time::Instant::now().checked_add(delay);
        loop {
            self.check()?;
            let left = until.map_or(BLOCKING_SLEEP_SLICE, |until| {
                until.saturating_duration_since(std::time::Instant::now())
            });
            if left.is_zero() {
                return Ok(());
            }
            std::thread::sleep(left.min(BLOCKING_SLEEP_SLICE));
        }
    }

    fn ensure_fits(&self, delay: Duration) -> Result<(), PipelineError> {
        self.check()?;
        match self.remaining() {
            Some(left) if delay > left => Err(self.deadline_error()),
            _ => Ok(()),
        }
    }

    fn deadline_error(&self) -> PipelineError {
        PipelineError::DeadlineExceeded(self.deadline.map_or(Duration::ZERO, |(_, budget)| budget))
    }
}

/// Per-call overrides accepted by `send`.
///
/// Overrides apply to a single call and never change the shared pipeline.
///
/// ```ignore
/// let options = RequestOptions::new()
///     .retry(RetryOptions::no_retries())
///     .timeout(Duration::from_secs(5))
///     .cancellation(token.clone());
/// client.send(request, options).await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    retry: Option<RetryOptions>,
    redirect: Option<RedirectOptions>,
    headers: HeaderMap,
    cancellation: Option<CancellationToken>,
    timeout: Option<Duration>,
    hooks: Hooks,
    context: Context,
}

impl RequestOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn retry(mut self, options: RetryOptions) -> Self {
        self.retry = Some(options);
        self
    }

    #[must_use]
    pub fn redirect(mut self, options: RedirectOptions) -> Self {
        self.redirect = Some(options);
        self
    }

    /// Add a header for this call only; it overrides pipeline defaults.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Overall budget for the call, retries and redirects included.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
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

    /// Seed the call context with a value visible to every policy.
    #[must_use]
    pub fn context_value<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.context.insert(value);
        self
    }
}

/// The mutable state of one logical call.
#[derive(Debug)]
pub struct Message {
    request: HttpRequest,
    response: Option<HttpResponse>,
    context: Context,
    control: CallControl,
}

impl Message {
    #[must_use]
    pub fn new(request: HttpRequest) -> Self {
        Self::with_options(request, RequestOptions::default())
    }

    #[must_use]
    pub fn with_options(request: HttpRequest, options: RequestOptions) -> Self {
        let RequestOptions {
            retry,
            redirect,
            headers,
            cancellation,
            timeout,
            hooks,
            mut context,
        } = options;

        if let Some(retry) = retry {
            context.insert(retry);
        }
        if let Some(redirect) = redirect {
            context.insert(redirect);
        }
        if !headers.is_empty() {
            context.insert(CallHeaders(headers));
        }
        if hooks.is_set() {
            context.insert(hooks);
        }

        Self {
            request,
            response: None,
            context,
            control: CallControl::new(cancellation, timeout),
        }
    }

    #[must_use]
    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut HttpRequest {
        &mut self.request
    }

    /// Replace the outgoing request, returning the previous one.
    pub fn replace_request(&mut self, request: HttpRequest) -> HttpRequest {
        std::mem::replace(&mut self.request, request)
    }

    #[must_use]
    pub fn response(&self) -> Option<&HttpResponse> {
        self.response.as_ref()
    }

    pub fn set_response(&mut self, response: HttpResponse) {
        self.response = Some(response);
    }

    pub fn take_response(&mut self) -> Option<HttpResponse> {
        self.response.take()
    }

    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    #[must_use]
    pub fn control(&self) -> &CallControl {
        &self.control
    }

    /// Hand the final response and context to the caller.
    ///
    /// # Errors
    /// Returns `PipelineError::MissingResponse` if no policy or transport
    /// produced a response.
    pub fn into_pipeline_response(self) -> Result<PipelineResponse, PipelineError> {
        let response = self.response.ok_or(PipelineError::MissingResponse)?;
        Ok(PipelineResponse::new(response, self.context))
    }
}
