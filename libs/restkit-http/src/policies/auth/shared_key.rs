use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::time::SystemTime;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use http::HeaderValue;
use http::header::{self, HeaderName};
use sha2::Sha256;
use zeroize::Zeroizing;

use super::{require_https, set_authorization};
use crate::error::{CredentialError, PipelineError};
use crate::request::{HttpRequest, RequestBody};

const DATE_HEADER: &str = "x-ms-date";
const SIGNED_HEADER_PREFIX: &str = "x-ms-";

/// Standard headers covered by the signature, in signing order.
const SIGNED_STANDARD_HEADERS: &[&str] = &[
    "content-encoding",
    "content-language",
    "content-length",
    "content-md5",
    "content-type",
    "date",
    "if-modified-since",
    "if-match",
    "if-none-match",
    "if-unmodified-since",
    "range",
];

/// Account name plus the decoded account key.
#[derive(Clone)]
pub struct SharedKeyCredential {
    account: String,
    key: Zeroizing<Vec<u8>>,
}

impl SharedKeyCredential {
    /// # Errors
    /// Returns `CredentialError::Config` if `key` is not valid base64.
    pub fn new(account: impl Into<String>, key: &str) -> Result<Self, CredentialError> {
        let key = STANDARD
            .decode(key.trim())
            .map_err(|e| CredentialError::Config(format!("account key is not base64: {e}")))?;
        Ok(Self {
            account: account.into(),
            key: Zeroizing::new(key),
        })
    }

    #[must_use]
    pub fn account(&self) -> &str {
        &self.account
    }

    fn sign(&self, string_to_sign: &str) -> Result<String, CredentialError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
            .map_err(|e| CredentialError::Config(e.to_string()))?;
        mac.update(string_to_sign.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}

impl fmt::Debug for SharedKeyCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedKeyCredential")
            .field("account", &self.account)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// `Authorization: SharedKey <account>:<signature>`, signed per attempt.
#[derive(Debug, Clone)]
pub struct SharedKeyPolicy {
    credential: SharedKeyCredential,
    allow_http: bool,
}

impl SharedKeyPolicy {
    #[must_use]
    pub fn new(credential: SharedKeyCredential) -> Self {
        Self {
            credential,
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
        self.sign_at(request, SystemTime::now())
    }

    fn sign_at(&self, request: &mut HttpRequest, now: SystemTime) -> Result<(), PipelineError> {
        let date = HeaderValue::from_str(&httpdate::fmt_http_date(now))?;
        request
            .headers_mut()
            .insert(HeaderName::from_static(DATE_HEADER), date);

        let string_to_sign = string_to_sign(request, &self.credential.account);
        let signature = self.credential.sign(&string_to_sign)?;
        let raw = Zeroizing::new(format!(
            "SharedKey {}:{signature}",
            self.credential.account
        ));
        set_authorization(request, &raw)
    }
}

fn string_to_sign(request: &HttpRequest, account: &str) -> String {
    let headers = request.headers();
    let mut out = String::new();
    out.push_str(request.method().as_str());
    out.push('\n');

    for &name in SIGNED_STANDARD_HEADERS {
        let value = if name == header::CONTENT_LENGTH.as_str() {
            content_length(request)
        } else {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_owned()
        };
        out.push_str(&value);
        out.push('\n');
    }

    let mut signed: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, value) in headers {
        if name.as_str().starts_with(SIGNED_HEADER_PREFIX) {
            signed
                .entry(name.as_str())
                .or_default()
                .push(value.to_str().unwrap_or_default().trim());
        }
    }
    for (name, values) in &signed {
        writeln!(out, "{name}:{}", values.join(",")).ok();
    }

    out.push_str(&canonical_resource(request, account));
    out
}

/// Empty for bodies of length zero.
fn content_length(request: &HttpRequest) -> String {
    let declared = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let length = declared.or_else(|| match request.body() {
        RequestBody::Bytes(bytes) => Some(bytes.len().to_string()),
        _ => None,
    });
    match length {
        Some(length) if length != "0" => length,
        _ => String::new(),
    }
}

fn canonical_resource(request: &HttpRequest, account: &str) -> String {
    let url = request.url();
    let mut out = format!("/{account}{}", url.path());

    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in url.query_pairs() {
        params
            .entry(name.to_lowercase())
            .or_default()
            .push(value.into_owned());
    }
    for (name, mut values) in params {
        values.sort();
        write!(out, "\n{name}:{}", values.join(",")).ok();
    }
    out
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use http::Method;
    use std::time::{Duration, UNIX_EPOCH};

    // base64("restkit-test-key")
    const KEY: &str = "cmVzdGtpdC10ZXN0LWtleQ==";

    fn listing_request() -> HttpRequest {
        HttpRequest::parse(
            Method::GET,
            "https://acct.blob.example/photos?restype=container&comp=list&include=metadata&Include=snapshots",
        )
        .unwrap()
        .with_header("x-ms-version", "2019-02-02")
        .unwrap()
    }

    #[test]
    fn test_string_to_sign_layout() {
        let mut request = listing_request();
        request.headers_mut().insert(
            HeaderName::from_static(DATE_HEADER),
            HeaderValue::from_static("Fri, 01 Mar 2024 10:00:00 GMT"),
        );

        let expected = "GET\n\n\n\n\n\n\n\n\n\n\n\n\
                        x-ms-date:Fri, 01 Mar 2024 10:00:00 GMT\n\
                        x-ms-version:2019-02-02\n\
                        /acct/photos\n\
                        comp:list\n\
                        include:metadata,snapshots\n\
                        restype:container";
        assert_eq!(string_to_sign(&request, "acct"), expected);
    }

    #[test]
    fn test_standard_headers_fill_their_slots() {
        let request = HttpRequest::parse(Method::PUT, "https://acct.blob.example/c/b")
            .unwrap()
            .with_header("Content-MD5", "Q2hlY2sgSW50ZWdyaXR5IQ==")
            .unwrap()
            .with_header("Content-Type", "text/plain")
            .unwrap()
            .with_header("Range", "bytes=0-99")
            .unwrap()
            .with_body("hello");

        let signed = string_to_sign(&request, "acct");
        let lines: Vec<&str> = signed.lines().collect();

        assert_eq!(lines[0], "PUT");
        assert_eq!(lines[3], "5");
        assert_eq!(lines[4], "Q2hlY2sgSW50ZWdyaXR5IQ==");
        assert_eq!(lines[5], "text/plain");
        assert_eq!(lines[11], "bytes=0-99");
        assert_eq!(lines[12], "/acct/c/b");
    }

    #[test]
    fn test_content_length_from_body() {
        let request = HttpRequest::parse(Method::PUT, "https://acct.blob.example/c/b")
            .unwrap()
            .with_body("hello");
        assert_eq!(content_length(&request), "5");

        let empty = HttpRequest::parse(Method::PUT, "https://acct.blob.example/c/b").unwrap();
        assert_eq!(content_length(&empty), "");
    }

    #[test]
    fn test_signature_header() {
        let credential = SharedKeyCredential::new("acct", KEY).unwrap();
        let policy = SharedKeyPolicy::new(credential);
        let mut request = listing_request();

        policy
            .sign_at(&mut request, UNIX_EPOCH + Duration::from_secs(1_709_287_200))
            .unwrap();

        assert_eq!(
            request.headers()[DATE_HEADER],
            "Fri, 01 Mar 2024 10:00:00 GMT"
        );
        let authorization = request.headers()[header::AUTHORIZATION].to_str().unwrap();
        assert_eq!(
            authorization,
            "SharedKey acct:xa2hjI2hHSsdaxyEbATHwMTGgRmG+8M4BEzRT36XWVM="
        );
        assert!(request.headers()[header::AUTHORIZATION].is_sensitive());
    }

    #[test]
    fn test_invalid_key_is_config_error() {
        assert!(matches!(
            SharedKeyCredential::new("acct", "not base64!"),
            Err(CredentialError::Config(_))
        ));
    }

    #[test]
    fn test_debug_hides_key() {
        let credential = SharedKeyCredential::new("acct", KEY).unwrap();
        assert!(!format!("{credential:?}").contains(KEY));
    }
}
