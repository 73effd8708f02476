//! Scripted transport shared by the policy tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, LOCATION};
use http::{HeaderMap, Method, StatusCode};
use parking_lot::Mutex;

use crate::error::{PipelineError, TransportError, TransportErrorKind};
use crate::request::HttpRequest;
use crate::response::HttpResponse;
use crate::transport::{AsyncTransport, BlockingTransport};

#[derive(Debug, Clone)]
pub enum Outcome {
    Respond {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Fail(TransportErrorKind),
}

impl Outcome {
    pub fn status(code: u16) -> Self {
        Self::Respond {
            status: StatusCode::from_u16(code).unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn redirect(code: u16, location: &str) -> Self {
        Self::status(code).header(LOCATION.as_str(), location)
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let Self::Respond { headers, .. } = &mut self {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        self
    }

    pub fn body(mut self, content_type: &str, text: &'static str) -> Self {
        self = self.header("content-type", content_type);
        if let Self::Respond { body, .. } = &mut self {
            *body = Bytes::from_static(text.as_bytes());
        }
        self
    }
}

/// Plays back a script of outcomes; the last one repeats forever.
pub struct MockTransport {
    script: Mutex<VecDeque<Outcome>>,
    requests: Mutex<Vec<HttpRequest>>,
    sent_at: Mutex<Vec<tokio::time::Instant>>,
    attempts: AtomicUsize,
    latency: Option<Duration>,
}

impl MockTransport {
    pub fn new(outcomes: Vec<Outcome>) -> Self {
        assert!(!outcomes.is_empty(), "script needs at least one outcome");
        Self {
            script: Mutex::new(outcomes.into()),
            requests: Mutex::new(Vec::new()),
            sent_at: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            latency: None,
        }
    }

    pub fn statuses(codes: &[u16]) -> Self {
        Self::new(codes.iter().copied().map(Outcome::status).collect())
    }

    pub fn failures(kinds: &[TransportErrorKind]) -> Self {
        Self::new(kinds.iter().copied().map(Outcome::Fail).collect())
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Gaps between consecutive attempts.
    pub fn gaps(&self) -> Vec<Duration> {
        self.sent_at
            .lock()
            .windows(2)
            .map(|pair| pair[1].duration_since(pair[0]))
            .collect()
    }

    fn next_outcome(&self, request: &HttpRequest) -> Result<HttpResponse, PipelineError> {
        // Consume the body the way a real transport would.
        request.body().read_all()?;
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        self.sent_at.lock().push(tokio::time::Instant::now());

        let outcome = {
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };
        match outcome.expect("script is never empty") {
            Outcome::Respond {
                status,
                headers,
                body,
            } => Ok(HttpResponse::new(status, headers, body, request.clone())),
            Outcome::Fail(kind) => Err(TransportError::new(
                kind,
                std::io::Error::other(format!("scripted {kind} failure")),
            )
            .into()),
        }
    }
}

#[async_trait]
impl AsyncTransport for MockTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, PipelineError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.next_outcome(request)
    }
}

impl BlockingTransport for MockTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, PipelineError> {
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
        self.next_outcome(request)
    }
}

pub fn get_request() -> HttpRequest {
    HttpRequest::parse(Method::GET, "https://example.com/items").unwrap()
}

pub fn request(method: Method, url: &str) -> HttpRequest {
    HttpRequest::parse(method, url).unwrap()
}

pub fn respond(request: &HttpRequest, status: StatusCode) -> HttpResponse {
    HttpResponse::new(status, HeaderMap::new(), Bytes::new(), request.clone())
}
