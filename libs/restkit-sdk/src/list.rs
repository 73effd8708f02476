//! Listing through a pipeline client.
//!
//! Every page is a fresh pipeline call built from the first request:
//!
//! - continuation tokens that are absolute URLs (`nextLink` style) are
//!   requested verbatim, keeping the method and headers of the first request
//! - any other token is sent as the configured query parameter on the first
//!   request's URL, replacing a previous value

use restkit_http::{BlockingPipelineClient, HttpRequest, PipelineClient, RequestOptions};
use serde::de::DeserializeOwned;
use url::Url;

use crate::page::{Page, PageError, PageFormat};
use crate::pager::{AsyncItemPaged, ItemPaged, PageFuture};

/// The request for the page `token` points to.
///
/// `None` yields the first request unchanged.
#[must_use]
pub fn page_request(first: &HttpRequest, token: Option<&str>, format: &PageFormat) -> HttpRequest {
    let mut request = first.clone();
    let Some(token) = token else {
        return request;
    };

    if let Ok(url) = Url::parse(token)
        && url.has_host()
    {
        request.set_url(url);
        return request;
    }

    let param = format.token_query_param.as_str();
    let kept: Vec<(String, String)> = first
        .url()
        .query_pairs()
        .filter(|(name, _)| name != param)
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    request
        .url_mut()
        .query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair(param, token);
    request
}

/// A listing operation: the first page request plus how to read pages.
///
/// ```rust,ignore
/// let items: AsyncItemPaged<Item> = ListRequest::new(client.get("items")?)
///     .options(RequestOptions::new().timeout(Duration::from_secs(30)))
///     .into_stream(&client);
/// ```
#[derive(Debug, Clone)]
pub struct ListRequest {
    first: HttpRequest,
    options: RequestOptions,
    format: PageFormat,
    resume: Option<String>,
}

impl ListRequest {
    #[must_use]
    pub fn new(first: HttpRequest) -> Self {
        Self {
            first,
            options: RequestOptions::default(),
            format: PageFormat::default(),
            resume: None,
        }
    }

    /// Options applied to every page call. A cancellation token or timeout
    /// here covers each page fetch separately.
    #[must_use]
    pub fn options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn format(mut self, format: PageFormat) -> Self {
        self.format = format;
        self
    }

    /// Start at the page a previously saved continuation token points to.
    #[must_use]
    pub fn resume_from(mut self, token: impl Into<String>) -> Self {
        self.resume = Some(token.into());
        self
    }

    /// Blocking listing over `client`.
    #[must_use]
    pub fn into_pager<T>(self, client: &BlockingPipelineClient) -> ItemPaged<T>
    where
        T: DeserializeOwned + 'static,
    {
        let Self {
            first,
            options,
            format,
            resume,
        } = self;
        let client = client.clone();
        let fetch = move |token: Option<String>| -> Result<Page<T>, PageError> {
            let request = page_request(&first, token.as_deref(), &format);
            let response = client.send(request, options.clone())?;
            Page::from_response(response, &format)
        };
        match resume {
            Some(token) => ItemPaged::from_continuation_token(token, fetch),
            None => ItemPaged::new(fetch),
        }
    }

    /// Async listing over `client`.
    #[must_use]
    pub fn into_stream<T>(self, client: &PipelineClient) -> AsyncItemPaged<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let Self {
            first,
            options,
            format,
            resume,
        } = self;
        let client = client.clone();
        let fetch = move |token: Option<String>| -> PageFuture<T> {
            let request = page_request(&first, token.as_deref(), &format);
            let client = client.clone();
            let options = options.clone();
            let format = format.clone();
            Box::pin(async move {
                let response = client.send(request, options).await?;
                Page::from_response(response, &format)
            })
        };
        match resume {
            Some(token) => AsyncItemPaged::from_continuation_token(token, fetch),
            None => AsyncItemPaged::new(fetch),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use restkit_http::Method;

    fn first() -> HttpRequest {
        HttpRequest::parse(Method::GET, "https://example.com/items?top=10")
            .unwrap()
            .with_header("x-tenant", "contoso")
            .unwrap()
    }

    #[test]
    fn test_first_page_is_unchanged() {
        let request = page_request(&first(), None, &PageFormat::default());
        assert_eq!(request.url().as_str(), "https://example.com/items?top=10");
    }

    #[test]
    fn test_absolute_token_is_requested_verbatim() {
        let request = page_request(
            &first(),
            Some("https://example.com/items?top=10&$skiptoken=abc%3D%3D"),
            &PageFormat::default(),
        );
        assert_eq!(
            request.url().as_str(),
            "https://example.com/items?top=10&$skiptoken=abc%3D%3D"
        );
        assert_eq!(request.headers()["x-tenant"], "contoso");
        assert_eq!(request.method(), &Method::GET);
    }

    #[test]
    fn test_opaque_token_becomes_query_parameter() {
        let format = PageFormat {
            token_query_param: "marker".to_owned(),
            ..PageFormat::default()
        };
        let seeded = first().with_query("marker", "old");

        let request = page_request(&seeded, Some("m/2"), &format);

        assert_eq!(
            request.url().as_str(),
            "https://example.com/items?top=10&marker=m%2F2"
        );
    }
}
