use bytes::Bytes;
use http::{Method, StatusCode};
use mime::Mime;

use super::SansIoPolicy;
use crate::error::{BoxError, DecodeError, PipelineError};
use crate::message::Message;
use crate::xml::XmlElement;

/// Structured view of a response body.
///
/// Stored in the call context; the raw bytes stay on the response.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum DecodedBody {
    Json(serde_json::Value),
    Xml(XmlElement),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFormat {
    Json,
    Xml,
    Text,
}

fn body_format(content_type: &str) -> Option<BodyFormat> {
    let mime: Mime = content_type.parse().ok()?;
    let is = |name: mime::Name<'_>| mime.subtype() == name || mime.suffix() == Some(name);

    if is(mime::JSON) {
        Some(BodyFormat::Json)
    } else if is(mime::XML) {
        Some(BodyFormat::Xml)
    } else if mime.type_() == mime::TEXT {
        Some(BodyFormat::Text)
    } else {
        None
    }
}

/// Decode `body` according to `content_type`.
///
/// Returns `None` when the content type is not JSON, XML or text.
///
/// # Errors
/// Returns `DecodeError` with the raw body when a recognized type fails to
/// parse.
pub fn decode_body(content_type: &str, body: &Bytes) -> Option<Result<DecodedBody, DecodeError>> {
    let format = body_format(content_type)?;
    let decoded: Result<DecodedBody, BoxError> = match format {
        BodyFormat::Json => serde_json::from_slice(body)
            .map(DecodedBody::Json)
            .map_err(Into::into),
        BodyFormat::Xml => XmlElement::parse(body)
            .map(DecodedBody::Xml)
            .map_err(Into::into),
        BodyFormat::Text => std::str::from_utf8(body)
            .map(|text| DecodedBody::Text(text.to_owned()))
            .map_err(Into::into),
    };
    Some(decoded.map_err(|source| DecodeError {
        content_type: content_type.to_owned(),
        body: body.clone(),
        source,
    }))
}

/// Exposes a decoded view of JSON, XML and text responses.
///
/// A body that fails to decode is an error for 2xx responses. For error
/// statuses the failure is only logged so the status error stays visible.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentDecodePolicy;

impl SansIoPolicy for ContentDecodePolicy {
    fn on_response(&self, message: &mut Message) -> Result<(), PipelineError> {
        let Some(response) = message.response() else {
            return Ok(());
        };
        if response.body().is_empty()
            || response.status() == StatusCode::NO_CONTENT
            || message.request().method() == Method::HEAD
        {
            return Ok(());
        }
        let Some(content_type) = response.content_type() else {
            return Ok(());
        };

        match decode_body(content_type, response.body()) {
            None => Ok(()),
            Some(Ok(decoded)) => {
                message.context_mut().insert(decoded);
                Ok(())
            }
            Some(Err(err)) if response.status().is_success() => Err(err.into()),
            Some(Err(err)) => {
                tracing::debug!(
                    status = response.status().as_u16(),
                    error = %err,
                    "Skipping undecodable error response body"
                );
                Ok(())
            }
        }
    }

    fn name(&self) -> &str {
        "content_decode"
    }
}
