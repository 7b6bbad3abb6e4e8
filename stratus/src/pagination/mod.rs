//! Lazy iteration over paginated results.
//!
//! The first page is always known; every further page is fetched on demand
//! from the previous page's token, one fetch at a time. Iteration ends when a
//! page carries no token, after which asking for another page returns
//! `EndOfPages` without a request.

mod blocking;
mod streaming;

pub use blocking::{fetcher, FnFetcher, ItemIterator, PageFetcher, PageIterator, Paginator};
pub use streaming::{AsyncPageFetcher, AsyncPageIterator, AsyncPaginator};
