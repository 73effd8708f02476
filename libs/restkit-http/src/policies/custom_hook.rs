use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use super::SansIoPolicy;
use crate::error::PipelineError;
use crate::message::Message;
use crate::request::HttpRequest;
use crate::response::HttpResponse;

/// Observes the request exactly as it is handed to the transport.
pub type RequestHook = Arc<dyn Fn(&HttpRequest) + Send + Sync>;

/// Observes every response coming back from the transport.
pub type ResponseHook = Arc<dyn Fn(&HttpResponse) + Send + Sync>;

/// A pair of raw hooks. Per-call hooks replace the client's hooks.
#[derive(Clone, Default)]
pub struct Hooks {
    pub on_request: Option<RequestHook>,
    pub on_response: Option<ResponseHook>,
}

impl Hooks {
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.on_request.is_some() || self.on_response.is_some()
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_request", &self.on_request.is_some())
            .field("on_response", &self.on_response.is_some())
            .finish()
    }
}

/// Runs raw request/response hooks close to the wire.
#[derive(Debug, Clone, Default)]
pub struct CustomHookPolicy {
    hooks: Hooks,
}

impl CustomHookPolicy {
    #[must_use]
    pub fn new(hooks: Hooks) -> Self {
        Self { hooks }
    }

    fn effective<'a>(&'a self, message: &'a Message) -> &'a Hooks {
        message.context().get::<Hooks>().unwrap_or(&self.hooks)
    }
}

impl SansIoPolicy for CustomHookPolicy {
    fn on_request(&self, message: &mut Message) -> Result<ControlFlow<HttpResponse>, PipelineError> {
        if let Some(hook) = &self.effective(message).on_request {
            hook(message.request());
        }
        Ok(ControlFlow::Continue(()))
    }

    fn on_response(&self, message: &mut Message) -> Result<(), PipelineError> {
        if let (Some(hook), Some(response)) = (&self.effective(message).on_response, message.response()) {
            hook(response);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "custom_hook"
    }
}
