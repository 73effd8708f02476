//! Paged sequences: lazy, forward-only iteration over a listing.
//!
//! A pager turns a page-fetching function into a sequence of items. Each
//! page fetch receives the continuation token of the previous page (`None`
//! for the first page) and the pager stops after a page without a token.
//!
//! ```rust,ignore
//! let mut users = ItemPaged::new(|token| fetch_users_page(token.as_deref()));
//! for user in &mut users {
//!     let user = user?;
//!     // ...
//! }
//! ```
//!
//! The async variant is a `Stream`:
//!
//! ```rust,ignore
//! use futures_util::StreamExt;
//!
//! let mut users = AsyncItemPaged::new(|token| fetch_users_page(token).boxed());
//! while let Some(user) = users.next().await {
//!     let user = user?;
//! }
//! ```
//!
//! A failed page fetch is yielded once as an error and ends the sequence;
//! items already yielded are not repeated. Resume a listing with
//! [`ItemPaged::from_continuation_token`] and a token saved from
//! [`ItemPaged::continuation_token`].

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use futures_util::future::BoxFuture;
use pin_project_lite::pin_project;

use crate::page::{Page, PageError};

/// Future returned by async page fetchers.
pub type PageFuture<T> = BoxFuture<'static, Result<Page<T>, PageError>>;

type BlockingFetch<T> = Box<dyn FnMut(Option<String>) -> Result<Page<T>, PageError> + Send>;
type AsyncFetch<T> = Box<dyn FnMut(Option<String>) -> PageFuture<T> + Send>;

enum Step {
    Fetch(Option<String>),
    Exhausted,
}

/// Position in a listing, shared by the blocking and async pagers.
struct Cursor<T> {
    items: std::vec::IntoIter<T>,
    token: Option<String>,
    started: bool,
    done: bool,
    pages: usize,
}

impl<T> Cursor<T> {
    fn new(token: Option<String>) -> Self {
        Self {
            items: Vec::new().into_iter(),
            token: token.filter(|token| !token.is_empty()),
            started: false,
            done: false,
            pages: 0,
        }
    }

    /// Token for the next fetch (`None` for the first page).
    fn next_fetch(&mut self) -> Step {
        if self.done || (self.started && self.token.is_none()) {
            self.done = true;
            return Step::Exhausted;
        }
        Step::Fetch(self.token.clone())
    }

    fn accept(&mut self, page: Page<T>) {
        self.pages += 1;
        tracing::debug!(
            page = self.pages,
            items = page.items.len(),
            last = page.is_last(),
            "page received"
        );
        self.started = true;
        self.token = page.continuation_token;
        self.items = page.items.into_iter();
    }

    fn fail(&mut self, error: &PageError) {
        tracing::debug!(page = self.pages + 1, error = %error, "page fetch failed");
        self.done = true;
        self.items = Vec::new().into_iter();
    }

    /// Remaining items of the current page as a page of their own.
    fn take_rest(&mut self) -> Option<Page<T>> {
        if self.items.as_slice().is_empty() {
            return None;
        }
        let items: Vec<T> = self.items.by_ref().collect();
        Some(Page::new(items, self.token.clone()))
    }
}

/// Blocking paged sequence of `T`.
///
/// Implements `Iterator<Item = Result<T, PageError>>`; the page fetch runs
/// on the calling thread when the current page is used up.
pub struct ItemPaged<T> {
    fetch: BlockingFetch<T>,
    cursor: Cursor<T>,
}

impl<T> ItemPaged<T> {
    /// Start a listing from its first page.
    #[must_use]
    pub fn new<F>(fetch: F) -> Self
    where
        F: FnMut(Option<String>) -> Result<Page<T>, PageError> + Send + 'static,
    {
        Self::with_cursor(fetch, Cursor::new(None))
    }

    /// Resume a listing at the page `token` points to.
    ///
    /// An empty token resumes at the first page.
    #[must_use]
    pub fn from_continuation_token<F>(token: impl Into<String>, fetch: F) -> Self
    where
        F: FnMut(Option<String>) -> Result<Page<T>, PageError> + Send + 'static,
    {
        Self::with_cursor(fetch, Cursor::new(Some(token.into())))
    }

    fn with_cursor<F>(fetch: F, cursor: Cursor<T>) -> Self
    where
        F: FnMut(Option<String>) -> Result<Page<T>, PageError> + Send + 'static,
    {
        Self {
            fetch: Box::new(fetch),
            cursor,
        }
    }

    /// Items of the current page not yet yielded.
    #[must_use]
    pub fn current_page(&self) -> &[T] {
        self.cursor.items.as_slice()
    }

    /// Token of the next page; persist it to resume later.
    ///
    /// `None` once the last page has been fetched.
    #[must_use]
    pub fn continuation_token(&self) -> Option<&str> {
        self.cursor.token.as_deref()
    }

    /// Fetch the next page, discarding what is left of the current one.
    ///
    /// Returns `Ok(false)` once the listing is exhausted.
    ///
    /// # Errors
    /// Returns the fetch error; the sequence is finished afterwards.
    pub fn advance(&mut self) -> Result<bool, PageError> {
        let Step::Fetch(token) = self.cursor.next_fetch() else {
            return Ok(false);
        };
        match (self.fetch)(token) {
            Ok(page) => {
                self.cursor.accept(page);
                Ok(true)
            }
            Err(error) => {
                self.cursor.fail(&error);
                Err(error)
            }
        }
    }

    /// Next whole page, starting with what is left of the current one.
    ///
    /// # Errors
    /// Returns the fetch error; the sequence is finished afterwards.
    pub fn next_page(&mut self) -> Result<Option<Page<T>>, PageError> {
        if let Some(rest) = self.cursor.take_rest() {
            return Ok(Some(rest));
        }
        if !self.advance()? {
            return Ok(None);
        }
        Ok(Some(
            self.cursor
                .take_rest()
                .unwrap_or_else(|| Page::new(Vec::new(), self.cursor.token.clone())),
        ))
    }

    /// View the listing page by page.
    pub fn by_page(mut self) -> impl Iterator<Item = Result<Page<T>, PageError>> {
        std::iter::from_fn(move || self.next_page().transpose())
    }
}

impl<T> Iterator for ItemPaged<T> {
    type Item = Result<T, PageError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.cursor.items.next() {
                return Some(Ok(item));
            }
            match self.advance() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(error) => return Some(Err(error)),
            }
        }
    }
}

impl<T> fmt::Debug for ItemPaged<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemPaged")
            .field("pages", &self.cursor.pages)
            .field("buffered", &self.cursor.items.len())
            .field("continuation_token", &self.cursor.token)
            .field("done", &self.cursor.done)
            .finish_non_exhaustive()
    }
}

pin_project! {
    /// Async paged sequence of `T`.
    ///
    /// Implements `Stream<Item = Result<T, PageError>>`. The next page is
    /// fetched lazily once the current page is used up; that fetch is the
    /// only suspension point of the stream.
    pub struct AsyncItemPaged<T> {
        fetch: AsyncFetch<T>,
        cursor: Cursor<T>,
        #[pin]
        in_flight: Option<PageFuture<T>>,
    }
}

impl<T> AsyncItemPaged<T> {
    /// Start a listing from its first page.
    #[must_use]
    pub fn new<F>(fetch: F) -> Self
    where
        F: FnMut(Option<String>) -> PageFuture<T> + Send + 'static,
    {
        Self::with_cursor(fetch, Cursor::new(None))
    }

    /// Resume a listing at the page `token` points to.
    #[must_use]
    pub fn from_continuation_token<F>(token: impl Into<String>, fetch: F) -> Self
    where
        F: FnMut(Option<String>) -> PageFuture<T> + Send + 'static,
    {
        Self::with_cursor(fetch, Cursor::new(Some(token.into())))
    }

    fn with_cursor<F>(fetch: F, cursor: Cursor<T>) -> Self
    where
        F: FnMut(Option<String>) -> PageFuture<T> + Send + 'static,
    {
        Self {
            fetch: Box::new(fetch),
            cursor,
            in_flight: None,
        }
    }

    /// Items of the current page not yet yielded.
    #[must_use]
    pub fn current_page(&self) -> &[T] {
        self.cursor.items.as_slice()
    }

    /// Token of the next page; persist it to resume later.
    #[must_use]
    pub fn continuation_token(&self) -> Option<&str> {
        self.cursor.token.as_deref()
    }

    /// Fetch the next page, discarding what is left of the current one.
    ///
    /// Returns `Ok(false)` once the listing is exhausted. Dropping the
    /// returned future before it completes leaves the position unchanged.
    ///
    /// # Errors
    /// Returns the fetch error; the sequence is finished afterwards.
    pub async fn advance(&mut self) -> Result<bool, PageError> {
        let fetch = match self.in_flight.take() {
            Some(fetch) => fetch,
            None => {
                let Step::Fetch(token) = self.cursor.next_fetch() else {
                    return Ok(false);
                };
                (self.fetch)(token)
            }
        };
        match fetch.await {
            Ok(page) => {
                self.cursor.accept(page);
                Ok(true)
            }
            Err(error) => {
                self.cursor.fail(&error);
                Err(error)
            }
        }
    }

    /// Next whole page, starting with what is left of the current one.
    ///
    /// # Errors
    /// Returns the fetch error; the sequence is finished afterwards.
    pub async fn next_page(&mut self) -> Result<Option<Page<T>>, PageError> {
        if let Some(rest) = self.cursor.take_rest() {
            return Ok(Some(rest));
        }
        if !self.advance().await? {
            return Ok(None);
        }
        Ok(Some(
            self.cursor
                .take_rest()
                .unwrap_or_else(|| Page::new(Vec::new(), self.cursor.token.clone())),
        ))
    }

    /// View the listing page by page.
    pub fn by_page(self) -> impl Stream<Item = Result<Page<T>, PageError>> {
        futures_util::stream::unfold(Some(self), |pager| async move {
            let mut pager = pager?;
            match pager.next_page().await {
                Ok(Some(page)) => Some((Ok(page), Some(pager))),
                Ok(None) => None,
                Err(error) => Some((Err(error), None)),
            }
        })
    }
}

impl<T> Stream for AsyncItemPaged<T> {
    type Item = Result<T, PageError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(item) = this.cursor.items.next() {
                return Poll::Ready(Some(Ok(item)));
            }

            if let Some(fetch) = this.in_flight.as_mut().as_pin_mut() {
                match fetch.poll(cx) {
                    Poll::Ready(Ok(page)) => {
                        this.in_flight.set(None);
                        this.cursor.accept(page);
                        continue;
                    }
                    Poll::Ready(Err(error)) => {
                        this.in_flight.set(None);
                        this.cursor.fail(&error);
                        return Poll::Ready(Some(Err(error)));
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }

            let Step::Fetch(token) = this.cursor.next_fetch() else {
                return Poll::Ready(None);
            };
            this.in_flight.set(Some((this.fetch)(token)));
        }
    }
}

impl<T> fmt::Debug for AsyncItemPaged<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncItemPaged")
            .field("pages", &self.cursor.pages)
            .field("buffered", &self.cursor.items.len())
            .field("continuation_token", &self.cursor.token)
            .field("fetching", &self.in_flight.is_some())
            .finish_non_exhaustive()
    }
}
