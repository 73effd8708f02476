#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Paged listings for RestKit pipeline clients.
//!
//! - [`Page`] and [`PageFormat`] describe the page wire shape
//! - [`ItemPaged`] (blocking, an `Iterator`) and [`AsyncItemPaged`] (a
//!   `Stream`) yield items lazily, fetching one page at a time
//! - [`ListRequest`] drives page fetches through a pipeline client
//!
//! ```rust,ignore
//! use futures_util::StreamExt;
//! use restkit_sdk::ListRequest;
//!
//! let mut items = ListRequest::new(client.get("items")?).into_stream::<Item>(&client);
//! while let Some(item) = items.next().await {
//!     let item = item?;
//! }
//! ```

mod list;
mod page;
mod pager;

pub use list::{ListRequest, page_request};
pub use page::{Page, PageError, PageFormat};
pub use pager::{AsyncItemPaged, ItemPaged, PageFuture};
