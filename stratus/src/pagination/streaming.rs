//! Asynchronous page iteration.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use tracing::debug;

use crate::errors::StratusError;

/// Asynchronous counterpart of [`PageFetcher`](super::PageFetcher).
#[async_trait]
pub trait AsyncPageFetcher: Send + Sync {
    /// One response interpreted as a page.
    type Page: Send;
    /// The cursor leading to the next page.
    type Token: Send;

    /// Token for the page after `page`, or `None` if `page` is the last.
    fn next_token(&self, page: &Self::Page) -> Option<Self::Token>;

    /// Fetches the page identified by `token`.
    ///
    /// # Errors
    ///
    /// Returns the failure of the underlying request.
    async fn fetch(&self, token: Self::Token) -> Result<Self::Page, StratusError>;
}

/// A cached first page plus an asynchronous fetcher.
pub struct AsyncPaginator<F: AsyncPageFetcher> {
    first_page: F::Page,
    fetcher: Arc<F>,
}

impl<F> AsyncPaginator<F>
where
    F: AsyncPageFetcher,
    F::Page: Clone,
{
    /// Creates a paginator from an already fetched first page.
    pub fn new(first_page: F::Page, fetcher: Arc<F>) -> Self {
        Self { first_page, fetcher }
    }

    /// The cached first page.
    pub fn first_page(&self) -> &F::Page {
        &self.first_page
    }

    /// A fresh iteration from the first page.
    pub fn pages(&self) -> AsyncPageIterator<F> {
        AsyncPageIterator::new(self.first_page.clone(), self.fetcher.clone())
    }
}

impl<F> std::fmt::Debug for AsyncPaginator<F>
where
    F: AsyncPageFetcher,
    F::Page: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncPaginator")
            .field("first_page", &self.first_page)
            .finish_non_exhaustive()
    }
}

/// Lazy asynchronous sequence of pages with at most one fetch in flight.
pub struct AsyncPageIterator<F: AsyncPageFetcher> {
    fetcher: Arc<F>,
    first: Option<F::Page>,
    next_token: Option<F::Token>,
    fetched: usize,
}

impl<F: AsyncPageFetcher> std::fmt::Debug for AsyncPageIterator<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncPageIterator")
            .field("has_next", &self.has_next())
            .field("fetched", &self.fetched)
            .finish()
    }
}

impl<F: AsyncPageFetcher> AsyncPageIterator<F> {
    /// Starts at `first_page`.
    pub fn new(first_page: F::Page, fetcher: Arc<F>) -> Self {
        Self {
            fetcher,
            first: Some(first_page),
            next_token: None,
            fetched: 0,
        }
    }

    /// Returns true if another page is available.
    pub fn has_next(&self) -> bool {
        self.first.is_some() || self.next_token.is_some()
    }

    /// Number of pages fetched so far, not counting the first.
    pub fn fetched(&self) -> usize {
        self.fetched
    }

    /// Returns the next page, fetching it if needed.
    ///
    /// # Errors
    ///
    /// `EndOfPages` once the last page was returned; no request is made.
    /// A failed fetch ends the iteration.
    pub async fn next_page(&mut self) -> Result<F::Page, StratusError> {
        if let Some(page) = self.first.take() {
            self.next_token = self.fetcher.next_token(&page);
            return Ok(page);
        }
        let token = self.next_token.take().ok_or(StratusError::EndOfPages)?;
        self.fetched += 1;
        debug!(page = self.fetched + 1, "Fetching page");
        let page = self.fetcher.fetch(token).await?;
        self.next_token = self.fetcher.next_token(&page);
        Ok(page)
    }
}

impl<F: AsyncPageFetcher + 'static> AsyncPageIterator<F> {
    /// Converts into a stream of pages that ends after the last page.
    pub fn into_stream(self) -> impl Stream<Item = Result<F::Page, StratusError>> + Send {
        futures::stream::unfold(self, |mut pages| async move {
            match pages.next_page().await {
                Err(StratusError::EndOfPages) => None,
                item => Some((item, pages)),
            }
        })
    }

    /// Converts into a stream of items, skipping empty pages.
    pub fn into_items<I, X>(self, mut extract: X) -> impl Stream<Item = Result<I, StratusError>> + Send
    where
        I: Send,
        X: FnMut(F::Page) -> Vec<I> + Send,
    {
        self.into_stream()
            .map_ok(move |page| futures::stream::iter(extract(page).into_iter().map(Ok)))
            .try_flatten()
    }

    /// Collects every remaining page.
    ///
    /// # Errors
    ///
    /// Returns the first fetch failure.
    pub async fn collect_pages(self) -> Result<Vec<F::Page>, StratusError> {
        self.into_stream().try_collect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    struct Listing {
        pages: Vec<(Vec<char>, Option<usize>)>,
        fetches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl AsyncPageFetcher for Listing {
        type Page = (Vec<char>, Option<usize>);
        type Token = usize;

        fn next_token(&self, page: &Self::Page) -> Option<usize> {
            page.1
        }

        async fn fetch(&self, token: usize) -> Result<Self::Page, StratusError> {
            self.fetches.lock().push(token);
            tokio::task::yield_now().await;
            self.pages
                .get(token)
                .cloned()
                .ok_or_else(|| StratusError::transmission("no such page"))
        }
    }

    fn paginator() -> (AsyncPaginator<Listing>, Arc<Listing>) {
        let listing = Arc::new(Listing {
            pages: vec![(vec![], Some(1)), (vec!['a', 'b'], Some(2)), (vec![], None)],
            fetches: Mutex::new(Vec::new()),
        });
        let first = listing.pages[0].clone();
        (AsyncPaginator::new(first, listing.clone()), listing)
    }

    #[tokio::test]
    async fn test_item_stream_flattens_pages() {
        let (paginator, listing) = paginator();
        let items: Vec<char> = paginator
            .pages()
            .into_items(|page: (Vec<char>, Option<usize>)| page.0)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(items, vec!['a', 'b']);
        assert_eq!(*listing.fetches.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_next_page_after_end() {
        let (paginator, listing) = paginator();
        let mut pages = paginator.pages();
        while pages.has_next() {
            pages.next_page().await.unwrap();
        }
        assert!(matches!(pages.next_page().await, Err(StratusError::EndOfPages)));
        assert_eq!(listing.fetches.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_collect_pages_restarts_per_iterator() {
        let (paginator, listing) = paginator();
        assert_eq!(paginator.pages().collect_pages().await.unwrap().len(), 3);
        assert_eq!(paginator.pages().collect_pages().await.unwrap().len(), 3);
        assert_eq!(listing.fetches.lock().len(), 4);
    }
}
