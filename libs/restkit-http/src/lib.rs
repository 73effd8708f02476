#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! HTTP request pipeline runtime.
//!
//! A request travels through an ordered chain of policies and ends at a
//! transport that performs exactly one exchange:
//!
//! - **Policies** add headers and a user agent, retry with exponential
//!   backoff, follow redirects safely, authenticate (bearer tokens with a
//!   coalescing token cache, SAS tokens, shared-key signatures), decode
//!   JSON/XML/text bodies, run raw hooks and log with secrets redacted
//! - **Transports** come in two flavours: an async hyper/rustls transport
//!   and a blocking ureq transport. Both bound in-flight requests, limit
//!   response bodies and decompress transparently
//! - **Pipelines** bind a policy chain to a transport; one pipeline serves
//!   any number of concurrent calls
//! - **Pipeline clients** assemble the canonical chain from a
//!   [`PipelineConfig`] and add base-URL helpers
//!
//! Every call can carry [`RequestOptions`]: retry/redirect overrides, extra
//! headers, raw hooks, a [`CancellationToken`] and an overall timeout.
//!
//! # Example
//!
//! ```ignore
//! use restkit_http::{PipelineClient, RequestOptions};
//! use std::time::Duration;
//!
//! let client = PipelineClient::builder()
//!     .base_url("https://inventory.example.com/api/")
//!     .application_id("inventory-sync/2.1")
//!     .build()?;
//!
//! let response = client
//!     .send(
//!         client.get("items?top=10")?,
//!         RequestOptions::new().timeout(Duration::from_secs(20)),
//!     )
//!     .await?
//!     .error_for_status()?;
//! let items: Vec<Item> = response.json()?;
//! ```

mod client;
mod config;
mod error;
mod message;
mod pipeline;
pub mod policies;
mod request;
mod response;
mod tls;
pub mod transport;
mod xml;

pub use client::{BlockingPipelineClient, PipelineClient, PipelineClientBuilder};
pub use config::{
    DEFAULT_MAX_BODY_SIZE, DEFAULT_REQUEST_ID_HEADER, IDEMPOTENCY_KEY_HEADER, LoggingOptions,
    PipelineConfig, RedirectOptions, RetryOptions, TlsRootConfig, TransportConfig,
    TransportSecurity, is_idempotent_method,
};
pub use error::{
    BoxError, CredentialError, DecodeError, HttpResponseError, PipelineError, TransportError,
    TransportErrorKind,
};
pub use message::{CallControl, Context, Message, RequestOptions};
pub use pipeline::{BlockingPipeline, Pipeline};
pub use policies::{Policy, SansIoPolicy};
pub use request::{HttpRequest, ReplayableBody, RequestBody, SingleUseBody};
pub use response::{HttpResponse, PipelineResponse, parse_retry_after};
pub use xml::{XmlElement, XmlError};

pub use bytes::Bytes;
pub use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
pub use tokio_util::sync::CancellationToken;
pub use url::Url;
