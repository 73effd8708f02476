use std::ops::ControlFlow;

use http::header::{HeaderValue, USER_AGENT};

use super::SansIoPolicy;
use crate::error::PipelineError;
use crate::message::Message;
use crate::response::HttpResponse;

/// `restkit-http/{version} ({os}; {arch})`
#[must_use]
pub fn default_user_agent() -> String {
    format!(
        "restkit-http/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Adds the `User-Agent` header.
///
/// The header is left alone when the request already carries one, unless
/// the policy was built with [`overwrite`](Self::overwrite).
#[derive(Debug, Clone)]
pub struct UserAgentPolicy {
    user_agent: HeaderValue,
    overwrite: bool,
}

impl UserAgentPolicy {
    /// Create a policy, prefixing the default agent with `application_id`.
    ///
    /// # Errors
    /// Returns `PipelineError::InvalidHeader` if the resulting value is not a
    /// valid header value.
    pub fn try_new(application_id: Option<&str>) -> Result<Self, PipelineError> {
        let value = match application_id {
            Some(id) if !id.trim().is_empty() => format!("{} {}", id.trim(), default_user_agent()),
            _ => default_user_agent(),
        };
        Ok(Self {
            user_agent: HeaderValue::from_str(&value)?,
            overwrite: false,
        })
    }

    /// Replace a caller-supplied `User-Agent` instead of keeping it.
    #[must_use]
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    #[must_use]
    pub fn user_agent(&self) -> &HeaderValue {
        &self.user_agent
    }
}

impl SansIoPolicy for UserAgentPolicy {
    fn on_request(&self, message: &mut Message) -> Result<ControlFlow<HttpResponse>, PipelineError> {
        let headers = message.request_mut().headers_mut();
        if self.overwrite || !headers.contains_key(USER_AGENT) {
            headers.insert(USER_AGENT, self.user_agent.clone());
        }
        Ok(ControlFlow::Continue(()))
    }

    fn name(&self) -> &str {
        "user_agent"
    }
}
