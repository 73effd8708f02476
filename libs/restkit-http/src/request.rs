use std::fmt;
use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use parking_lot::Mutex;
use serde::Serialize;
use url::Url;

use crate::error::PipelineError;

/// A body source that can be read again from the start.
///
/// Implement this for file-backed or generated payloads that must survive
/// retries and 307/308 redirects without being buffered up front.
pub trait ReplayableBody: Send + Sync {
    /// Read the full body from the beginning.
    ///
    /// # Errors
    /// Returns the underlying I/O error if the source cannot be read.
    fn replay(&self) -> std::io::Result<Bytes>;
}

/// A body that can be read exactly once.
///
/// Clones share the same reader, so after the first attempt consumes it
/// every clone reports [`is_consumed`](Self::is_consumed).
#[derive(Clone)]
pub struct SingleUseBody {
    reader: Arc<Mutex<Option<Box<dyn Read + Send>>>>,
}

impl SingleUseBody {
    pub fn new(reader: impl Read + Send + 'static) -> Self {
        Self {
            reader: Arc::new(Mutex::new(Some(Box::new(reader)))),
        }
    }

    #[must_use]
    pub fn is_consumed(&self) -> bool {
        self.reader.lock().is_none()
    }

    fn take(&self) -> Option<Box<dyn Read + Send>> {
        self.reader.lock().take()
    }
}

/// Outgoing request body.
#[derive(Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes(Bytes),
    Replayable(Arc<dyn ReplayableBody>),
    SingleUse(SingleUseBody),
}

impl RequestBody {
    /// Body held in memory (no blocking read needed to send it).
    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        matches!(self, Self::Empty | Self::Bytes(_))
    }

    /// Whether the body can still be sent (again).
    #[must_use]
    pub fn can_replay(&self) -> bool {
        match self {
            Self::Empty | Self::Bytes(_) | Self::Replayable(_) => true,
            Self::SingleUse(body) => !body.is_consumed(),
        }
    }

    /// Materialize the body for sending.
    ///
    /// A single-use body is consumed by this call.
    ///
    /// # Errors
    /// Returns `PipelineError::BodyNotReplayable` for an already consumed
    /// single-use body and `PipelineError::BodyRead` if reading fails.
    pub fn read_all(&self) -> Result<Bytes, PipelineError> {
        match self {
            Self::Empty => Ok(Bytes::new()),
            Self::Bytes(bytes) => Ok(bytes.clone()),
            Self::Replayable(source) => source.replay().map_err(PipelineError::BodyRead),
            Self::SingleUse(body) => {
                let mut reader = body
                    .take()
                    .ok_or(PipelineError::BodyNotReplayable { cause: None })?;
                let mut buf = Vec::new();
                reader
                    .read_to_end(&mut buf)
                    .map_err(PipelineError::BodyRead)?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Self::Replayable(_) => f.write_str("Replayable"),
            Self::SingleUse(body) => f
                .debug_struct("SingleUse")
                .field("consumed", &body.is_consumed())
                .finish(),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        Self::Bytes(Bytes::from(text))
    }
}

impl From<&'static str> for RequestBody {
    fn from(text: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

/// An HTTP request travelling through the pipeline.
///
/// Header names are case-insensitive and inserting replaces previous
/// values. Policies rebuild attempts from a clone of the original request,
/// so only policy-added headers differ between retries.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: RequestBody,
}

impl HttpRequest {
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    /// Parse `url` and create a request.
    ///
    /// # Errors
    /// Returns `PipelineError::InvalidUrl` if `url` is not an absolute URL.
    pub fn parse(method: Method, url: &str) -> Result<Self, PipelineError> {
        let parsed = Url::parse(url).map_err(|source| PipelineError::InvalidUrl {
            url: url.to_owned(),
            source,
        })?;
        Ok(Self::new(method, parsed))
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    pub fn set_url(&mut self, url: Url) {
        self.url = url;
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    #[must_use]
    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<RequestBody>) {
        self.body = body.into();
    }

    /// Add a header, replacing any existing value.
    ///
    /// # Errors
    /// Returns `PipelineError::InvalidHeader` if the name or value is invalid.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, PipelineError> {
        let name = HeaderName::from_bytes(name.as_bytes())?;
        let value = HeaderValue::from_str(value)?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Append a query parameter.
    #[must_use]
    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.url.query_pairs_mut().append_pair(name, value);
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    /// Serialize `value` as the JSON body and set `Content-Type`.
    ///
    /// # Errors
    /// Returns `PipelineError::InvalidRequest` if serialization fails.
    pub fn with_json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, PipelineError> {
        let body = serde_json::to_vec(value)
            .map_err(|e| PipelineError::InvalidRequest(format!("JSON serialization failed: {e}")))?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = RequestBody::from(body);
        Ok(self)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct StaticSource(&'static [u8]);

    impl ReplayableBody for StaticSource {
        fn replay(&self) -> std::io::Result<Bytes> {
            Ok(Bytes::from_static(self.0))
        }
    }

    #[test]
    fn test_headers_are_case_insensitive_last_write_wins() {
        let request = HttpRequest::parse(Method::GET, "https://example.com/items")
            .unwrap()
            .with_header("X-Tag", "first")
            .unwrap()
            .with_header("x-tag", "second")
            .unwrap();

        assert_eq!(request.headers().get("X-TAG").unwrap(), "second");
        assert_eq!(request.headers().len(), 1);
    }

    #[test]
    fn test_single_use_body_is_consumed_once() {
        let body = RequestBody::SingleUse(SingleUseBody::new(Cursor::new(b"payload".to_vec())));
        let clone = body.clone();
        assert!(body.can_replay());

        assert_eq!(body.read_all().unwrap(), Bytes::from_static(b"payload"));
        assert!(!clone.can_replay());
        assert!(matches!(
            clone.read_all(),
            Err(PipelineError::BodyNotReplayable { cause: None })
        ));
    }

    #[test]
    fn test_replayable_body_reads_repeatedly() {
        let body = RequestBody::Replayable(Arc::new(StaticSource(b"again")));
        assert_eq!(body.read_all().unwrap(), Bytes::from_static(b"again"));
        assert_eq!(body.read_all().unwrap(), Bytes::from_static(b"again"));
        assert!(body.can_replay());
        assert!(!body.is_in_memory());
    }

    #[test]
    fn test_with_json_sets_content_type() {
        let request = HttpRequest::parse(Method::POST, "https://example.com/items")
            .unwrap()
            .with_json(&serde_json::json!({ "name": "widget" }))
            .unwrap();

        assert_eq!(
            request.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(
            request.body().read_all().unwrap(),
            Bytes::from_static(br#"{"name":"widget"}"#)
        );
    }

    #[test]
    fn test_invalid_url_is_reported() {
        let err = HttpRequest::parse(Method::GET, "not a url").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidUrl { .. }));
    }
}
