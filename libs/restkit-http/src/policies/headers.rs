use std::ops::ControlFlow;

use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;

use super::SansIoPolicy;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::message::Message;
use crate::response::HttpResponse;

/// Extra headers for a single call, stored in the call context.
#[derive(Debug, Clone, Default)]
pub struct CallHeaders(pub HeaderMap);

/// Adds default headers and a generated request id.
///
/// Headers already present on the request win over defaults; per-call
/// headers win over both.
#[derive(Debug, Clone, Default)]
pub struct HeadersPolicy {
    defaults: HeaderMap,
    request_id_header: Option<HeaderName>,
}

impl HeadersPolicy {
    #[must_use]
    pub fn new(defaults: HeaderMap, request_id_header: Option<HeaderName>) -> Self {
        Self {
            defaults,
            request_id_header,
        }
    }

    /// Build from the `headers` and `request_id_header` config fields.
    ///
    /// # Errors
    /// Returns `PipelineError::InvalidHeader` for invalid names or values.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let mut defaults = HeaderMap::with_capacity(config.headers.len());
        for (name, value) in &config.headers {
            defaults.insert(
                HeaderName::from_bytes(name.as_bytes())?,
                HeaderValue::from_str(value)?,
            );
        }
        let request_id_header = config
            .request_id_header
            .as_deref()
            .map(|name| HeaderName::from_bytes(name.as_bytes()))
            .transpose()?;
        Ok(Self::new(defaults, request_id_header))
    }
}

impl SansIoPolicy for HeadersPolicy {
    fn on_request(&self, message: &mut Message) -> Result<ControlFlow<HttpResponse>, PipelineError> {
        let call_headers = message.context().get::<CallHeaders>().cloned();
        let headers = message.request_mut().headers_mut();

        for (name, value) in &self.defaults {
            if !headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
        if let Some(CallHeaders(extra)) = call_headers {
            for (name, value) in &extra {
                headers.insert(name.clone(), value.clone());
            }
        }
        if let Some(name) = &self.request_id_header
            && !headers.contains_key(name)
        {
            let id = uuid::Uuid::new_v4().to_string();
            headers.insert(name.clone(), HeaderValue::from_str(&id)?);
        }
        Ok(ControlFlow::Continue(()))
    }

    fn name(&self) -> &str {
        "headers"
    }
}
