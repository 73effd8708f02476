//! Page wire model.
//!
//! A listing endpoint answers with a JSON object holding the page items and
//! an optional continuation token:
//!
//! ```json
//! { "value": [ ... ], "nextLink": "https://host/items?page=2" }
//! ```
//!
//! Both field names are configurable through [`PageFormat`].

use restkit_http::{PipelineError, PipelineResponse};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error surfaced while listing.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PageError {
    /// The page request failed or returned a non-2xx status
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Page items could not be deserialized
    #[error("Failed to deserialize page items: {0}")]
    Items(#[source] serde_json::Error),

    /// The payload does not have the expected shape
    #[error("Malformed page payload: field '{field}' {reason}")]
    Malformed { field: String, reason: String },
}

/// Field names used to read pages and to send continuation tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PageFormat {
    /// Field holding the item array (default: `value`)
    pub items_field: String,

    /// Field holding the continuation token (default: `nextLink`)
    pub next_link_field: String,

    /// Query parameter carrying tokens that are not absolute URLs
    /// (default: `continuationToken`)
    pub token_query_param: String,
}

impl Default for PageFormat {
    fn default() -> Self {
        Self {
            items_field: "value".to_owned(),
            next_link_field: "nextLink".to_owned(),
            token_query_param: "continuationToken".to_owned(),
        }
    }
}

/// One page: items in server order plus the token for the next page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// `None` on the last page.
    pub continuation_token: Option<String>,
}

impl<T> Page<T> {
    /// Build a page; an empty token is treated as the end of the listing.
    #[must_use]
    pub fn new(items: Vec<T>, continuation_token: Option<String>) -> Self {
        Self {
            items,
            continuation_token: continuation_token.filter(|token| !token.is_empty()),
        }
    }

    #[must_use]
    pub fn is_last(&self) -> bool {
        self.continuation_token.is_none()
    }
}

impl<T: DeserializeOwned> Page<T> {
    /// Read a page from a JSON payload.
    ///
    /// A missing or `null` item field is an empty page; a missing, `null` or
    /// empty token ends the listing.
    ///
    /// # Errors
    /// Returns `PageError::Malformed` if the payload is not an object or a
    /// field has the wrong type, `PageError::Items` if items do not match `T`.
    pub fn from_value(payload: Value, format: &PageFormat) -> Result<Self, PageError> {
        let Value::Object(mut fields) = payload else {
            return Err(PageError::Malformed {
                field: format.items_field.clone(),
                reason: "is missing because the payload is not a JSON object".to_owned(),
            });
        };

        let items = match fields.remove(&format.items_field) {
            None | Some(Value::Null) => Vec::new(),
            Some(items @ Value::Array(_)) => {
                serde_json::from_value(items).map_err(PageError::Items)?
            }
            Some(_) => {
                return Err(PageError::Malformed {
                    field: format.items_field.clone(),
                    reason: "is not an array".to_owned(),
                });
            }
        };

        let continuation_token = match fields.remove(&format.next_link_field) {
            None | Some(Value::Null) => None,
            Some(Value::String(token)) => Some(token),
            Some(_) => {
                return Err(PageError::Malformed {
                    field: format.next_link_field.clone(),
                    reason: "is not a string".to_owned(),
                });
            }
        };

        Ok(Self::new(items, continuation_token))
    }

    /// Read a page from a successful pipeline response.
    ///
    /// # Errors
    /// Returns `PageError::Pipeline` for a non-2xx status or a body that is
    /// not JSON, otherwise as [`from_value`](Self::from_value).
    pub fn from_response(response: PipelineResponse, format: &PageFormat) -> Result<Self, PageError> {
        let response = response.error_for_status()?;
        let payload: Value = response.json()?;
        Self::from_value(payload, format)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_wire_shape() {
        let page: Page<u32> = Page::from_value(
            json!({ "value": [1, 2], "nextLink": "https://example.com/items?page=2" }),
            &PageFormat::default(),
        )
        .unwrap();

        assert_eq!(page.items, vec![1, 2]);
        assert_eq!(
            page.continuation_token.as_deref(),
            Some("https://example.com/items?page=2")
        );
        assert!(!page.is_last());
    }

    #[test]
    fn test_custom_field_names() {
        let format = PageFormat {
            items_field: "entries".to_owned(),
            next_link_field: "marker".to_owned(),
            ..PageFormat::default()
        };
        let page: Page<String> =
            Page::from_value(json!({ "entries": ["a"], "marker": "m-2" }), &format).unwrap();

        assert_eq!(page.items, vec!["a"]);
        assert_eq!(page.continuation_token.as_deref(), Some("m-2"));
    }

    #[test]
    fn test_empty_or_missing_token_ends_listing() {
        let format = PageFormat::default();
        let empty: Page<u32> =
            Page::from_value(json!({ "value": [], "nextLink": "" }), &format).unwrap();
        let null: Page<u32> =
            Page::from_value(json!({ "value": [3], "nextLink": null }), &format).unwrap();
        let missing: Page<u32> = Page::from_value(json!({}), &format).unwrap();

        assert!(empty.is_last());
        assert!(null.is_last());
        assert!(missing.is_last());
        assert!(missing.items.is_empty());
    }

    #[test]
    fn test_malformed_payloads() {
        let format = PageFormat::default();

        let err = Page::<u32>::from_value(json!([1, 2]), &format).unwrap_err();
        assert!(matches!(err, PageError::Malformed { ref field, .. } if field == "value"));

        let err = Page::<u32>::from_value(json!({ "value": 5 }), &format).unwrap_err();
        assert!(matches!(err, PageError::Malformed { .. }));

        let err = Page::<u32>::from_value(json!({ "value": [], "nextLink": 7 }), &format)
            .unwrap_err();
        assert!(matches!(err, PageError::Malformed { ref field, .. } if field == "nextLink"));

        let err = Page::<u32>::from_value(json!({ "value": ["x"] }), &format).unwrap_err();
        assert!(matches!(err, PageError::Items(_)));
    }

    #[test]
    fn test_format_from_config() {
        let format: PageFormat = serde_json::from_str(r#"{ "token_query_param": "marker" }"#).unwrap();
        assert_eq!(format.token_query_param, "marker");
        assert_eq!(format.items_field, "value");
    }
}
