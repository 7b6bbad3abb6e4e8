//! Synchronous page and item iteration.

use std::collections::VecDeque;
use std::marker::PhantomData;

use crate::errors::StratusError;
use tracing::debug;

/// Fetches pages and extracts continuation tokens.
pub trait PageFetcher {
    /// One response interpreted as a page.
    type Page;
    /// The cursor leading to the next page.
    type Token;

    /// Token for the page after `page`, or `None` if `page` is the last.
    fn next_token(&self, page: &Self::Page) -> Option<Self::Token>;

    /// Fetches the page identified by `token`.
    ///
    /// # Errors
    ///
    /// Returns the failure of the underlying request.
    fn fetch(&self, token: Self::Token) -> Result<Self::Page, StratusError>;
}

/// [`PageFetcher`] built from two closures.
pub struct FnFetcher<P, T, N, F> {
    next_token: N,
    fetch: F,
    _marker: PhantomData<fn(T) -> P>,
}

impl<P, T, N, F> std::fmt::Debug for FnFetcher<P, T, N, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnFetcher").finish_non_exhaustive()
    }
}

/// Builds a fetcher from a token extractor and a fetch function.
pub fn fetcher<P, T, N, F>(next_token: N, fetch: F) -> FnFetcher<P, T, N, F>
where
    N: Fn(&P) -> Option<T>,
    F: Fn(T) -> Result<P, StratusError>,
{
    FnFetcher {
        next_token,
        fetch,
        _marker: PhantomData,
    }
}

impl<P, T, N, F> PageFetcher for FnFetcher<P, T, N, F>
where
    N: Fn(&P) -> Option<T>,
    F: Fn(T) -> Result<P, StratusError>,
{
    type Page = P;
    type Token = T;

    fn next_token(&self, page: &P) -> Option<T> {
        (self.next_token)(page)
    }

    fn fetch(&self, token: T) -> Result<P, StratusError> {
        (self.fetch)(token)
    }
}

/// A first page plus the means to fetch the rest.
///
/// Each call to [`pages`](Self::pages) or [`items`](Self::items) starts a
/// fresh, independent iteration from the cached first page.
pub struct Paginator<F: PageFetcher> {
    first_page: F::Page,
    fetcher: F,
}

impl<F> std::fmt::Debug for Paginator<F>
where
    F: PageFetcher,
    F::Page: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Paginator")
            .field("first_page", &self.first_page)
            .finish_non_exhaustive()
    }
}

impl<F> Paginator<F>
where
    F: PageFetcher,
    F::Page: Clone,
{
    /// Creates a paginator from an already fetched first page.
    pub fn new(first_page: F::Page, fetcher: F) -> Self {
        Self { first_page, fetcher }
    }

    /// The cached first page.
    pub fn first_page(&self) -> &F::Page {
        &self.first_page
    }

    /// Iterates pages from the first.
    pub fn pages(&self) -> PageIterator<'_, F> {
        PageIterator::new(self.first_page.clone(), &self.fetcher)
    }

    /// Iterates items from the first page on.
    pub fn items<I, X>(&self, extract: X) -> ItemIterator<'_, F, I, X>
    where
        X: FnMut(F::Page) -> Vec<I>,
    {
        ItemIterator::new(self.pages(), extract)
    }
}

/// Lazy sequence of pages; fetches only when asked for the next one.
pub struct PageIterator<'a, F: PageFetcher> {
    fetcher: &'a F,
    first: Option<F::Page>,
    next_token: Option<F::Token>,
    fetched: usize,
}

impl<F: PageFetcher> std::fmt::Debug for PageIterator<'_, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageIterator")
            .field("has_next", &self.has_next())
            .field("fetched", &self.fetched)
            .finish()
    }
}

impl<'a, F: PageFetcher> PageIterator<'a, F> {
    /// Starts at `first_page`.
    pub fn new(first_page: F::Page, fetcher: &'a F) -> Self {
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
    pub fn next_page(&mut self) -> Result<F::Page, StratusError> {
        if let Some(page) = self.first.take() {
            self.next_token = self.fetcher.next_token(&page);
            return Ok(page);
        }
        let token = self.next_token.take().ok_or(StratusError::EndOfPages)?;
        self.fetched += 1;
        debug!(page = self.fetched + 1, "Fetching page");
        let page = self.fetcher.fetch(token)?;
        self.next_token = self.fetcher.next_token(&page);
        Ok(page)
    }
}

impl<F: PageFetcher> Iterator for PageIterator<'_, F> {
    type Item = Result<F::Page, StratusError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_page() {
            Err(StratusError::EndOfPages) => None,
            other => Some(other),
        }
    }
}

/// Items of consecutive pages, in page order then within-page order.
///
/// Empty pages are skipped.
pub struct ItemIterator<'a, F: PageFetcher, I, X> {
    pages: PageIterator<'a, F>,
    extract: X,
    buffer: VecDeque<I>,
}

impl<F: PageFetcher, I, X> std::fmt::Debug for ItemIterator<'_, F, I, X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemIterator")
            .field("pages", &self.pages)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl<'a, F, I, X> ItemIterator<'a, F, I, X>
where
    F: PageFetcher,
    X: FnMut(F::Page) -> Vec<I>,
{
    /// Flattens `pages` with `extract`.
    pub fn new(pages: PageIterator<'a, F>, extract: X) -> Self {
        Self {
            pages,
            extract,
            buffer: VecDeque::new(),
        }
    }

    /// Returns true if another item is available.
    ///
    /// May fetch pages until a non-empty one or the end is found.
    ///
    /// # Errors
    ///
    /// Returns a fetch failure.
    pub fn has_next(&mut self) -> Result<bool, StratusError> {
        self.fill()
    }

    /// Returns the next item.
    ///
    /// # Errors
    ///
    /// `EndOfItems` after the last item; otherwise a fetch failure.
    pub fn next_item(&mut self) -> Result<I, StratusError> {
        if !self.fill()? {
            return Err(StratusError::EndOfItems);
        }
        self.buffer.pop_front().ok_or(StratusError::EndOfItems)
    }

    fn fill(&mut self) -> Result<bool, StratusError> {
        while self.buffer.is_empty() {
            if !self.pages.has_next() {
                return Ok(false);
            }
            let page = self.pages.next_page()?;
            self.buffer.extend((self.extract)(page));
        }
        Ok(true)
    }
}

impl<F, I, X> Iterator for ItemIterator<'_, F, I, X>
where
    F: PageFetcher,
    X: FnMut(F::Page) -> Vec<I>,
{
    type Item = Result<I, StratusError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_item() {
            Err(StratusError::EndOfItems) => None,
            other => Some(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;

    #[derive(Debug, Clone, PartialEq)]
    struct Page {
        items: Vec<&'static str>,
        next: Option<usize>,
    }

    fn page(items: Vec<&'static str>, next: Option<usize>) -> Page {
        Page { items, next }
    }

    struct Listing {
        pages: Vec<Page>,
        fetches: RefCell<Vec<usize>>,
    }

    impl PageFetcher for Listing {
        type Page = Page;
        type Token = usize;

        fn next_token(&self, page: &Page) -> Option<usize> {
            page.next
        }

        fn fetch(&self, token: usize) -> Result<Page, StratusError> {
            self.fetches.borrow_mut().push(token);
            self.pages
                .get(token)
                .cloned()
                .ok_or_else(|| StratusError::transmission("no such page"))
        }
    }

    fn listing() -> Listing {
        Listing {
            pages: vec![
                page(vec![], Some(1)),
                page(vec!["a", "b"], Some(2)),
                page(vec![], None),
            ],
            fetches: RefCell::new(Vec::new()),
        }
    }

    #[test]
    fn test_items_skip_empty_pages_and_stop_at_end() {
        let fetcher = listing();
        let first = fetcher.pages[0].clone();
        let paginator = Paginator::new(first, fetcher);
        let mut items = paginator.items(|p: Page| p.items);

        assert_eq!(items.next_item().unwrap(), "a");
        assert_eq!(items.next_item().unwrap(), "b");
        assert!(matches!(items.next_item(), Err(StratusError::EndOfItems)));
        assert!(matches!(items.next_item(), Err(StratusError::EndOfItems)));
        assert_eq!(*paginator.fetcher.fetches.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_next_page_after_end_never_fetches() {
        let fetcher = listing();
        let first = fetcher.pages[0].clone();
        let paginator = Paginator::new(first, fetcher);
        let mut pages = paginator.pages();

        for _ in 0..3 {
            pages.next_page().unwrap();
        }
        assert!(!pages.has_next());
        assert!(matches!(pages.next_page(), Err(StratusError::EndOfPages)));
        assert!(matches!(pages.next_page(), Err(StratusError::EndOfPages)));
        assert_eq!(pages.fetched(), 2);
        assert_eq!(paginator.fetcher.fetches.borrow().len(), 2);
    }

    #[test]
    fn test_fresh_iterators_restart_from_first_page() {
        let fetcher = listing();
        let first = fetcher.pages[0].clone();
        let paginator = Paginator::new(first, fetcher);

        let all: Vec<_> = paginator.pages().collect::<Result<_, _>>().unwrap();
        assert_eq!(all.len(), 3);
        let again: Vec<_> = paginator.items(|p: Page| p.items).collect::<Result<_, _>>().unwrap();
        assert_eq!(again, vec!["a", "b"]);
        assert_eq!(paginator.fetcher.fetches.borrow().len(), 4);
    }

    #[test]
    fn test_single_page_makes_no_request() {
        let fetched = RefCell::new(0);
        let fetcher = fetcher(
            |_: &Vec<u32>| None::<()>,
            |()| {
                *fetched.borrow_mut() += 1;
                Ok(Vec::new())
            },
        );
        let paginator = Paginator::new(vec![1, 2, 3], fetcher);
        let items: Vec<u32> = paginator.items(|p| p).map(Result::unwrap).collect();
        assert_eq!(items, vec![1, 2, 3]);
        assert_eq!(*fetched.borrow(), 0);
    }

    #[test]
    fn test_fetch_failure_ends_iteration() {
        let fetcher = fetcher(
            |p: &Vec<u32>| if p.is_empty() { None } else { Some(()) },
            |()| Err(StratusError::transmission("boom")),
        );
        let paginator = Paginator::new(vec![1], fetcher);
        let mut pages = paginator.pages();
        pages.next_page().unwrap();
        assert!(matches!(pages.next_page(), Err(StratusError::Transmission(_))));
        assert!(matches!(pages.next_page(), Err(StratusError::EndOfPages)));
    }
}
