use super::{Secret, require_https};
use crate::error::PipelineError;
use crate::request::HttpRequest;

/// Appends a shared access signature to the query string.
///
/// Parameters already present on the URL are left untouched, so a request
/// that was signed by hand keeps its own signature.
#[derive(Debug, Clone)]
pub struct SasTokenPolicy {
    token: Secret,
    allow_http: bool,
}

impl SasTokenPolicy {
    /// `token` is the query fragment, with or without a leading `?`.
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            token: Secret::new(token.trim_start_matches('?')),
            allow_http: false,
        }
    }

    #[must_use]
    pub fn allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }

    pub(super) fn authorize(&self, request: &mut HttpRequest) -> Result<(), PipelineError> {
        require_https(request, self.allow_http)?;
        let present: Vec<String> = request
            .url()
            .query_pairs()
            .map(|(name, _)| name.into_owned())
            .collect();
        let missing: Vec<(String, String)> = url::form_urlencoded::parse(self.token.expose().as_bytes())
            .filter(|(name, _)| !present.iter().any(|existing| existing == name))
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        if !missing.is_empty() {
            request.url_mut().query_pairs_mut().extend_pairs(missing);
        }
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use http::Method;

    const TOKEN: &str = "?sv=2019-02-02&ss=b&sig=abc%2Bdef%3D";

    #[test]
    fn test_token_is_appended() {
        let policy = SasTokenPolicy::new(TOKEN);
        let mut request =
            HttpRequest::parse(Method::GET, "https://acct.blob.example/c/blob?comp=list").unwrap();

        policy.authorize(&mut request).unwrap();

        let pairs: Vec<(String, String)> = request
            .url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(pairs[0], ("comp".to_owned(), "list".to_owned()));
        assert!(pairs.contains(&("sig".to_owned(), "abc+def=".to_owned())));
        assert!(pairs.contains(&("sv".to_owned(), "2019-02-02".to_owned())));
    }

    #[test]
    fn test_signing_twice_does_not_duplicate() {
        let policy = SasTokenPolicy::new(TOKEN);
        let mut request = HttpRequest::parse(Method::GET, "https://acct.blob.example/c").unwrap();

        policy.authorize(&mut request).unwrap();
        policy.authorize(&mut request).unwrap();

        let sigs = request
            .url()
            .query_pairs()
            .filter(|(k, _)| k == "sig")
            .count();
        assert_eq!(sigs, 1);
    }

    #[test]
    fn test_http_requires_opt_in() {
        let mut request = HttpRequest::parse(Method::GET, "http://127.0.0.1:10000/c").unwrap();
        assert!(SasTokenPolicy::new(TOKEN).authorize(&mut request).is_err());
        SasTokenPolicy::new(TOKEN)
            .allow_http(true)
            .authorize(&mut request)
            .unwrap();
        assert!(request.url().query().unwrap().contains("sig="));
    }

    #[test]
    fn test_debug_hides_token() {
        let rendered = format!("{:?}", SasTokenPolicy::new(TOKEN));
        assert!(!rendered.contains("sig"));
    }
}
