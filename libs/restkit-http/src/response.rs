use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::{DecodeError, HttpResponseError, PipelineError};
use crate::message::Context;
use crate::policies::DecodedBody;
use crate::request::HttpRequest;

/// Parse `Retry-After` header value into a `Duration`.
///
/// Supports two formats per RFC 7231:
/// - Seconds: "120" → 120 seconds
/// - HTTP-date (RFC 1123): "Wed, 21 Oct 2015 07:28:00 GMT" → duration until that time
///
/// A date in the past yields `Duration::ZERO` (retry immediately).
/// Returns `None` if the header is missing, unparsable, or a negative number.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?;
    let trimmed = value.trim();

    if let Ok(seconds) = trimmed.parse::<i64>() {
        if seconds < 0 {
            return None;
        }
        return Some(Duration::from_secs(seconds.cast_unsigned()));
    }

    let parsed = httpdate::parse_http_date(trimmed).ok()?;
    Some(
        parsed
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO),
    )
}

/// A buffered HTTP response.
///
/// The body has already been decompressed and bounded by the transport's
/// `max_body_size`. The request that produced the response is kept
/// alongside it.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    request: HttpRequest,
}

impl HttpResponse {
    #[must_use]
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes, request: HttpRequest) -> Self {
        Self {
            status,
            headers,
            body,
            request,
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    #[must_use]
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// The request that produced this response (after redirects).
    #[must_use]
    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        parse_retry_after(&self.headers)
    }

    /// Body as UTF-8 text; invalid sequences are replaced.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parse the body as JSON.
    ///
    /// # Errors
    /// Returns `PipelineError::Decode` carrying the raw body if parsing fails.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, PipelineError> {
        serde_json::from_slice(&self.body).map_err(|source| {
            PipelineError::Decode(DecodeError {
                content_type: self
                    .content_type()
                    .unwrap_or("application/json")
                    .to_owned(),
                body: self.body.clone(),
                source: Box::new(source),
            })
        })
    }

    /// Convert non-2xx responses into `HttpResponseError`.
    ///
    /// # Errors
    /// Returns `HttpResponseError` with the status, headers and body if the
    /// status is not 2xx.
    pub fn error_for_status(self) -> Result<Self, HttpResponseError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(HttpResponseError::from_response(&self))
        }
    }
}

/// Result of a pipeline call: the final response plus the call context.
///
/// The context holds values policies recorded for this call, such as the
/// decoded body or the number of redirects followed.
#[derive(Debug)]
pub struct PipelineResponse {
    response: HttpResponse,
    context: Context,
}

impl PipelineResponse {
    pub(crate) fn new(response: HttpResponse, context: Context) -> Self {
        Self { response, context }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    #[must_use]
    pub fn http_response(&self) -> &HttpResponse {
        &self.response
    }

    #[must_use]
    pub fn into_http_response(self) -> HttpResponse {
        self.response
    }

    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Structured view produced by the content-decode policy, if any.
    #[must_use]
    pub fn decoded(&self) -> Option<&DecodedBody> {
        self.context.get::<DecodedBody>()
    }

    /// Deserialize the body as JSON, reusing the decoded view when present.
    ///
    /// # Errors
    /// Returns `PipelineError::Decode` if the body does not match `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, PipelineError> {
        match self.decoded() {
            Some(DecodedBody::Json(value)) => {
                T::deserialize(value).map_err(|source| {
                    PipelineError::Decode(DecodeError {
                        content_type: self
                            .response
                            .content_type()
                            .unwrap_or("application/json")
                            .to_owned(),
                        body: self.response.body().clone(),
                        source: Box::new(source),
                    })
                })
            }
            _ => self.response.json(),
        }
    }

    #[must_use]
    pub fn text(&self) -> String {
        self.response.text()
    }

    /// Convert a non-2xx final response into `PipelineError::HttpResponse`.
    ///
    /// # Errors
    /// Returns the status, headers and body of a non-2xx response.
    pub fn error_for_status(self) -> Result<Self, PipelineError> {
        if self.response.status().is_success() {
            Ok(self)
        } else {
            Err(HttpResponseError::from_response(&self.response).into())
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use http::Method;

    fn response(status: u16, content_type: &str, body: &'static str) -> HttpResponse {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, content_type.parse().unwrap());
        HttpResponse::new(
            StatusCode::from_u16(status).unwrap(),
            headers,
            Bytes::from_static(body.as_bytes()),
            HttpRequest::parse(Method::GET, "https://example.com/items").unwrap(),
        )
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::RETRY_AFTER, "120".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_parse_retry_after_seconds_with_whitespace() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::RETRY_AFTER, "  60  ".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_parse_retry_after_missing_or_invalid() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(http::header::RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(http::header::RETRY_AFTER, "-5".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let mut headers = HeaderMap::new();
        let future = SystemTime::now() + Duration::from_secs(120);
        headers.insert(
            http::header::RETRY_AFTER,
            httpdate::fmt_http_date(future).parse().unwrap(),
        );
        let delay = parse_retry_after(&headers).unwrap();
        assert!(delay <= Duration::from_secs(120));
        assert!(delay >= Duration::from_secs(118));

        headers.insert(
            http::header::RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(parse_retry_after(&headers), Some(Duration::ZERO));
    }

    #[test]
    fn test_error_for_status_keeps_body() {
        let err = response(409, "application/json", r#"{"code":"Conflict"}"#)
            .error_for_status()
            .unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.body_text(), r#"{"code":"Conflict"}"#);
        assert_eq!(err.content_type.as_deref(), Some("application/json"));
    }

    #[test]
    fn test_json_failure_carries_raw_body() {
        let err = response(200, "application/json", "{broken")
            .json::<serde_json::Value>()
            .unwrap_err();
        match err {
            PipelineError::Decode(decode) => {
                assert_eq!(decode.body, Bytes::from_static(b"{broken"));
                assert_eq!(decode.content_type, "application/json");
            }
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn test_pipeline_response_json_uses_decoded_view() {
        let mut context = Context::default();
        context.insert(DecodedBody::Json(serde_json::json!({ "id": 7 })));
        let result = PipelineResponse::new(response(200, "application/json", r#"{"id":7}"#), context);

        let value: serde_json::Value = result.json().unwrap();
        assert_eq!(value["id"], 7);
        assert!(matches!(result.decoded(), Some(DecodedBody::Json(_))));
    }
}
