use std::time::Duration;

use http::{HeaderName, HeaderValue, Method};
use rand::Rng;

use super::{BlockingNext, Next};
use crate::config::RetryOptions;
use crate::error::{HttpResponseError, PipelineError};
use crate::message::Message;
use crate::request::HttpRequest;

/// Header carrying the retry number (1-based) on retried attempts.
pub const RETRY_ATTEMPT_HEADER: &str = "X-Retry-Attempt";

/// Longest wait honored between attempts, whether computed or sent by the
/// server in `Retry-After` (one day).
const MAX_RETRY_DELAY: Duration = Duration::from_secs(86_400);

/// Zero-based attempt number of the request currently in flight.
///
/// Inserted into the call context before every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt(pub u32);

/// Calculate backoff duration for a given retry number.
///
/// `initial * multiplier^attempt`, capped at `max_backoff`, plus 0-25%
/// jitter when enabled. Non-finite or negative inputs are sanitized so the
/// result is always a valid, bounded duration.
#[must_use]
pub fn backoff_delay(options: &RetryOptions, attempt: u32) -> Duration {
    let max_backoff_secs = MAX_RETRY_DELAY.as_secs_f64();
    let attempt = i32::try_from(attempt).unwrap_or(i32::MAX);

    let multiplier = if options.backoff_multiplier.is_finite() && options.backoff_multiplier >= 0.0
    {
        options.backoff_multiplier
    } else {
        1.0
    };

    let initial_secs = options.backoff_factor.as_secs_f64();
    let initial_secs = if initial_secs.is_finite() && initial_secs >= 0.0 {
        initial_secs
    } else {
        0.0
    };

    let max_secs = options.max_backoff.as_secs_f64();
    let max_secs = if max_secs.is_finite() && max_secs >= 0.0 {
        max_secs.min(max_backoff_secs)
    } else {
        max_backoff_secs
    };

    let base = initial_secs * multiplier.powi(attempt);
    let clamped = if base.is_finite() {
        base.min(max_secs).max(0.0)
    } else {
        max_secs
    };
    let duration = Duration::from_secs_f64(clamped);

    let duration = if options.jitter {
        let jitter_factor = rand::rng().random_range(0.0..=0.25);
        duration + duration.mul_f64(jitter_factor)
    } else {
        duration
    };

    // Keep jittered value within max_backoff
    duration.min(Duration::from_secs_f64(max_secs))
}

/// Re-executes the inner chain on retryable failures.
///
/// Each attempt starts from a fresh copy of the request as it reached this
/// policy, so redirect and authentication re-run on every attempt. Per-call
/// [`RetryOptions`] in the context replace the configured ones.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    options: RetryOptions,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }

    #[must_use]
    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    pub(super) async fn send(
        &self,
        message: &mut Message,
        next: Next<'_>,
    ) -> Result<(), PipelineError> {
        let options = self.effective(message);
        let mut state = RetryState::new(&options, message.request().clone());
        loop {
            state.prepare(message)?;
            let outcome = next.run(message).await;
            match state.evaluate(message, outcome)? {
                Step::Done => return Ok(()),
                Step::Backoff(delay) => message.control().sleep(delay).await?,
            }
        }
    }

    pub(super) fn send_blocking(
        &self,
        message: &mut Message,
        next: BlockingNext<'_>,
    ) -> Result<(), PipelineError> {
        let options = self.effective(message);
        let mut state = RetryState::new(&options, message.request().clone());
        loop {
            state.prepare(message)?;
            let outcome = next.run(message);
            match state.evaluate(message, outcome)? {
                Step::Done => return Ok(()),
                Step::Backoff(delay) => message.control().sleep_blocking(delay)?,
            }
        }
    }

    fn effective(&self, message: &Message) -> RetryOptions {
        message
            .context()
            .get::<RetryOptions>()
            .unwrap_or(&self.options)
            .clone()
    }
}

enum Step {
    Done,
    Backoff(Duration),
}

/// Per-call retry state machine: `Attempt(n)` then `Done` or `Backoff(n)`.
struct RetryState<'o> {
    options: &'o RetryOptions,
    original: HttpRequest,
    has_idempotency_key: bool,
    attempt: u32,
    previous_backoff: Duration,
}

impl<'o> RetryState<'o> {
    fn new(options: &'o RetryOptions, original: HttpRequest) -> Self {
        let has_idempotency_key = options
            .idempotency_key_header
            .as_deref()
            .is_some_and(|name| original.headers().contains_key(name));
        Self {
            options,
            original,
            has_idempotency_key,
            attempt: 0,
            previous_backoff: Duration::ZERO,
        }
    }

    fn method(&self) -> &Method {
        self.original.method()
    }

    fn prepare(&self, message: &mut Message) -> Result<(), PipelineError> {
        message.control().check()?;
        message.context_mut().insert(RetryAttempt(self.attempt));
        if self.attempt > 0 {
            message.take_response();
            let mut request = self.original.clone();
            request.headers_mut().insert(
                HeaderName::from_static("x-retry-attempt"),
                HeaderValue::from(self.attempt),
            );
            message.replace_request(request);
        }
        Ok(())
    }

    fn evaluate(
        &mut self,
        message: &Message,
        outcome: Result<(), PipelineError>,
    ) -> Result<Step, PipelineError> {
        match outcome {
            Ok(()) => self.evaluate_response(message),
            Err(err) => self.evaluate_error(err),
        }
    }

    fn evaluate_response(&mut self, message: &Message) -> Result<Step, PipelineError> {
        let Some(response) = message.response() else {
            return Ok(Step::Done);
        };
        let status = response.status();
        if !self
            .options
            .should_retry_status(status, self.method(), self.has_idempotency_key)
        {
            return Ok(Step::Done);
        }
        if self.attempt >= self.options.total_retries {
            tracing::debug!(
                attempts = self.attempt + 1,
                status = status.as_u16(),
                "Retry budget exhausted, returning last response"
            );
            return Ok(Step::Done);
        }
        if !self.original.body().can_replay() {
            return Err(PipelineError::BodyNotReplayable {
                cause: Some(Box::new(HttpResponseError::from_response(response).into())),
            });
        }

        let retry_after = if self.options.ignore_retry_after {
            None
        } else {
            response
                .retry_after()
                .map(|requested| requested.min(MAX_RETRY_DELAY))
        };
        let delay = retry_after.unwrap_or_else(|| self.next_backoff());

        tracing::debug!(
            retry = self.attempt + 1,
            max_retries = self.options.total_retries,
            status = status.as_u16(),
            method = %self.method(),
            host = self.original.url().host_str().unwrap_or("unknown"),
            backoff_ms = delay.as_millis(),
            retry_after_used = retry_after.is_some(),
            "Retrying request after status code"
        );
        self.attempt += 1;
        Ok(Step::Backoff(delay))
    }

    fn evaluate_error(&mut self, err: PipelineError) -> Result<Step, PipelineError> {
        let Some(kind) = err.transport_kind() else {
            return Err(err);
        };
        if !self
            .options
            .should_retry_transport(kind, self.method(), self.has_idempotency_key)
        {
            return Err(err);
        }
        if self.attempt >= self.options.total_retries {
            if self.attempt == 0 {
                return Err(err);
            }
            return Err(PipelineError::RetryExhausted {
                attempts: self.attempt + 1,
                last: Box::new(err),
            });
        }
        if !self.original.body().can_replay() {
            return Err(PipelineError::BodyNotReplayable {
                cause: Some(Box::new(err)),
            });
        }

        let delay = self.next_backoff();
        tracing::debug!(
            retry = self.attempt + 1,
            max_retries = self.options.total_retries,
            error = %err,
            trigger = %kind,
            method = %self.method(),
            host = self.original.url().host_str().unwrap_or("unknown"),
            backoff_ms = delay.as_millis(),
            "Retrying request after error"
        );
        self.attempt += 1;
        Ok(Step::Backoff(delay))
    }

    /// Computed backoff never shrinks between attempts of one call.
    fn next_backoff(&mut self) -> Duration {
        let delay = backoff_delay(self.options, self.attempt).max(self.previous_backoff);
        self.previous_backoff = delay;
        delay
    }
}
