//! Single-producer, single-consumer body channel with explicit demand.
//!
//! The consumer grants demand with [`BodySubscription::request`]; the producer
//! may emit at most that many chunks before [`BodySender::send`] suspends
//! again. Exactly one terminal signal ends the channel, and queued chunks are
//! always drained before it is observed.

use super::ChunkFilter;
use crate::errors::StratusError;
use bytes::{Bytes, BytesMut};
use futures::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::trace;

/// The signal that ends a channel.
#[derive(Debug, Clone)]
pub enum Terminal {
    /// No more chunks.
    Completed,
    /// The producer failed.
    Failed(StratusError),
}

#[derive(Debug, Default)]
struct ChannelState {
    /// Granted demand not yet used by the producer.
    demand: u64,
    /// Chunks produced but not yet taken by the consumer.
    queue: VecDeque<Bytes>,
    /// Chunks of an in-memory source, moved to `queue` as demand arrives.
    source: Option<VecDeque<Bytes>>,
    terminal: Option<Terminal>,
    subscribed: bool,
    cancelled: bool,
}

impl ChannelState {
    /// Moves in-memory chunks into the queue up to the current demand.
    fn drain_source(&mut self) {
        let Some(source) = self.source.as_mut() else {
            return;
        };
        while self.demand > 0 {
            match source.pop_front() {
                Some(chunk) => {
                    self.demand -= 1;
                    self.queue.push_back(chunk);
                }
                None => break,
            }
        }
        if source.is_empty() && self.terminal.is_none() {
            self.terminal = Some(Terminal::Completed);
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<ChannelState>,
    producer_wake: Notify,
    consumer_wake: Notify,
}

impl Shared {
    fn grant(&self, n: u64) {
        if n == 0 {
            return;
        }
        let mut state = self.state.lock();
        if state.cancelled {
            return;
        }
        state.demand = state.demand.saturating_add(n);
        state.drain_source();
        drop(state);
        self.producer_wake.notify_one();
        self.consumer_wake.notify_one();
    }

    fn cancel(&self) {
        let mut state = self.state.lock();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        state.queue.clear();
        state.demand = 0;
        drop(state);
        trace!("Body stream cancelled by consumer");
        self.producer_wake.notify_one();
    }

    fn finish(&self, terminal: Terminal) {
        let mut state = self.state.lock();
        if state.terminal.is_none() {
            state.terminal = Some(terminal);
        }
        drop(state);
        self.consumer_wake.notify_one();
    }
}

/// Creates a connected producer/consumer pair.
#[must_use]
pub fn channel() -> (BodySender, ByteStream) {
    let shared = Arc::new(Shared::default());
    (
        BodySender {
            shared: shared.clone(),
            finished: false,
        },
        ByteStream::from_shared(shared),
    )
}

/// The producing half of a body channel.
#[derive(Debug)]
pub struct BodySender {
    shared: Arc<Shared>,
    finished: bool,
}

impl BodySender {
    /// Emits one chunk, waiting for demand if none is outstanding.
    ///
    /// Empty chunks are dropped without consuming demand.
    ///
    /// # Errors
    ///
    /// Returns `StratusError::Cancelled` once the consumer has cancelled.
    pub async fn send(&mut self, chunk: Bytes) -> Result<(), StratusError> {
        if chunk.is_empty() {
            return Ok(());
        }
        loop {
            {
                let mut state = self.shared.state.lock();
                if state.cancelled {
                    return Err(StratusError::Cancelled(
                        "body consumer cancelled the stream".to_string(),
                    ));
                }
                if state.demand > 0 {
                    state.demand -= 1;
                    state.queue.push_back(chunk);
                    drop(state);
                    self.shared.consumer_wake.notify_one();
                    return Ok(());
                }
            }
            self.shared.producer_wake.notified().await;
        }
    }

    /// Signals successful completion.
    pub fn complete(mut self) {
        self.finished = true;
        self.shared.finish(Terminal::Completed);
    }

    /// Signals failure.
    pub fn fail(mut self, error: StratusError) {
        self.finished = true;
        self.shared.finish(Terminal::Failed(error));
    }

    /// Returns true once the consumer has cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.state.lock().cancelled
    }

    /// Resolves when the consumer cancels.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            self.shared.producer_wake.notified().await;
        }
    }

    /// Demand currently granted and unused.
    #[must_use]
    pub fn demand(&self) -> u64 {
        self.shared.state.lock().demand
    }
}

impl Drop for BodySender {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.finish(Terminal::Failed(StratusError::transmission(
                "body producer dropped before completion",
            )));
        }
    }
}

/// A lazily consumed body: the publishing half handed to consumers.
///
/// At most one [`BodySubscription`] may be attached. Dropping a stream that
/// was never subscribed cancels its producer.
pub struct ByteStream {
    shared: Arc<Shared>,
    filters: Vec<Box<dyn ChunkFilter>>,
    content_length: Option<u64>,
    attached: bool,
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("filters", &self.filters.iter().map(|f| f.name()).collect::<Vec<_>>())
            .field("content_length", &self.content_length)
            .field("attached", &self.attached)
            .finish()
    }
}

impl ByteStream {
    fn from_shared(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            filters: Vec::new(),
            content_length: None,
            attached: false,
        }
    }

    /// Creates a stream over in-memory chunks.
    ///
    /// Chunks are released only as demand is granted.
    #[must_use]
    pub fn from_chunks(chunks: impl IntoIterator<Item = Bytes>) -> Self {
        let source: VecDeque<Bytes> = chunks.into_iter().filter(|c| !c.is_empty()).collect();
        let length = source.iter().map(|c| c.len() as u64).sum();
        let mut state = ChannelState {
            source: Some(source),
            ..ChannelState::default()
        };
        state.drain_source();
        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            ..Shared::default()
        });
        Self::from_shared(shared).with_content_length(Some(length))
    }

    /// Creates a single-chunk stream.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::from_chunks([bytes.into()])
    }

    /// Creates an empty, completed stream.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_chunks(std::iter::empty())
    }

    /// Creates a stream that fails immediately.
    #[must_use]
    pub fn failed(error: StratusError) -> Self {
        let (sender, stream) = channel();
        sender.fail(error);
        stream
    }

    /// Layers a filter on top of the filters already present.
    #[must_use]
    pub fn with_filter(mut self, filter: impl ChunkFilter + 'static) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    /// Sets the declared length of the body.
    #[must_use]
    pub fn with_content_length(mut self, length: Option<u64>) -> Self {
        self.content_length = length;
        self
    }

    /// Declared length of the body, if known.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Attaches the single consumer.
    ///
    /// # Errors
    ///
    /// Returns `StratusError::AlreadySubscribed` on a second call.
    pub fn subscribe(&mut self) -> Result<BodySubscription, StratusError> {
        {
            let mut state = self.shared.state.lock();
            if state.subscribed {
                return Err(StratusError::AlreadySubscribed);
            }
            state.subscribed = true;
        }
        self.attached = true;
        Ok(BodySubscription {
            shared: self.shared.clone(),
            filters: std::mem::take(&mut self.filters),
            done: false,
        })
    }

    /// Subscribes and reads the whole body into memory.
    ///
    /// # Errors
    ///
    /// Returns the stream's failure, or `AlreadySubscribed`.
    pub async fn collect(mut self) -> Result<Bytes, StratusError> {
        self.subscribe()?.collect().await
    }
}

impl Drop for ByteStream {
    fn drop(&mut self) {
        if !self.attached {
            self.shared.cancel();
        }
    }
}

/// The consuming half attached to a [`ByteStream`].
///
/// Dropping the subscription before the terminal signal cancels the producer.
pub struct BodySubscription {
    shared: Arc<Shared>,
    filters: Vec<Box<dyn ChunkFilter>>,
    done: bool,
}

impl std::fmt::Debug for BodySubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodySubscription")
            .field("done", &self.done)
            .finish()
    }
}

impl BodySubscription {
    /// Grants demand for `n` more chunks.
    pub fn request(&self, n: u64) {
        if !self.done {
            self.shared.grant(n);
        }
    }

    /// Cancels the subscription. No error is delivered to this consumer.
    pub fn cancel(&mut self) {
        if !self.done {
            self.done = true;
            self.shared.cancel();
        }
    }

    /// Returns true once a terminal signal was observed or the subscription
    /// was cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Waits for the next chunk under the explicit demand contract.
    ///
    /// Returns `None` after completion, `Some(Err(_))` exactly once on
    /// failure. Without granted demand this waits until demand is granted
    /// from elsewhere or the producer terminates.
    pub async fn next(&mut self) -> Option<Result<Bytes, StratusError>> {
        self.next_inner(false).await
    }

    /// Like [`next`](Self::next), but grants one chunk of demand when
    /// nothing is outstanding.
    pub async fn pull(&mut self) -> Option<Result<Bytes, StratusError>> {
        self.next_inner(true).await
    }

    /// Reads the remaining body into memory.
    ///
    /// # Errors
    ///
    /// Returns the stream's failure.
    pub async fn collect(mut self) -> Result<Bytes, StratusError> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.pull().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }

    /// Converts into a `futures::Stream` that pulls one chunk at a time.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, StratusError>> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.pull().await.map(|item| (item, subscription))
        })
    }

    async fn next_inner(&mut self, auto_demand: bool) -> Option<Result<Bytes, StratusError>> {
        loop {
            if self.done {
                return None;
            }
            let step = {
                let mut state = self.shared.state.lock();
                if let Some(chunk) = state.queue.pop_front() {
                    Step::Chunk(chunk)
                } else if let Some(terminal) = state.terminal.take() {
                    Step::Terminal(terminal)
                } else if auto_demand && state.demand == 0 && !state.cancelled {
                    state.demand = 1;
                    state.drain_source();
                    Step::Granted
                } else {
                    Step::Wait
                }
            };
            match step {
                Step::Chunk(chunk) => match self.apply_filters(chunk) {
                    Ok(Some(chunk)) => return Some(Ok(chunk)),
                    Ok(None) => self.shared.grant(1),
                    Err(error) => {
                        self.done = true;
                        self.shared.cancel();
                        return Some(Err(error));
                    }
                },
                Step::Terminal(Terminal::Completed) => {
                    self.done = true;
                    return match self.complete_filters() {
                        Ok(()) => None,
                        Err(error) => Some(Err(error)),
                    };
                }
                Step::Terminal(Terminal::Failed(error)) => {
                    self.done = true;
                    return Some(Err(error));
                }
                Step::Granted => self.shared.producer_wake.notify_one(),
                Step::Wait => self.shared.consumer_wake.notified().await,
            }
        }
    }

    fn apply_filters(&mut self, chunk: Bytes) -> Result<Option<Bytes>, StratusError> {
        let mut current = chunk;
        for filter in &mut self.filters {
            match filter.on_chunk(current)? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    fn complete_filters(&mut self) -> Result<(), StratusError> {
        for filter in &mut self.filters {
            filter.on_complete()?;
        }
        Ok(())
    }
}

enum Step {
    Chunk(Bytes),
    Terminal(Terminal),
    Granted,
    Wait,
}

impl Drop for BodySubscription {
    fn drop(&mut self) {
        if !self.done {
            self.shared.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_producer_waits_for_demand() {
        let (mut sender, mut stream) = channel();
        let mut subscription = stream.subscribe().unwrap();

        {
            let mut send = task::spawn(sender.send(Bytes::from_static(b"a")));
            assert_pending!(send.poll());
            subscription.request(1);
            assert!(send.is_woken());
            assert_ready!(send.poll()).unwrap();
        }

        assert_eq!(subscription.next().await.unwrap().unwrap(), "a");
        assert_eq!(sender.demand(), 0);
    }

    #[tokio::test]
    async fn test_producer_emits_at_most_granted_demand() {
        let (mut sender, mut stream) = channel();
        let subscription = stream.subscribe().unwrap();
        subscription.request(2);

        sender.send(Bytes::from_static(b"1")).await.unwrap();
        sender.send(Bytes::from_static(b"2")).await.unwrap();

        let mut third = task::spawn(sender.send(Bytes::from_static(b"3")));
        assert_pending!(third.poll());
    }

    #[tokio::test]
    async fn test_second_subscriber_rejected() {
        let (_sender, mut stream) = channel();
        let _first = stream.subscribe().unwrap();
        assert!(matches!(stream.subscribe(), Err(StratusError::AlreadySubscribed)));
    }

    #[tokio::test]
    async fn test_chunks_drained_before_completion() {
        let (mut sender, mut stream) = channel();
        let mut subscription = stream.subscribe().unwrap();
        subscription.request(2);
        sender.send(Bytes::from_static(b"x")).await.unwrap();
        sender.send(Bytes::from_static(b"y")).await.unwrap();
        sender.complete();

        assert_eq!(subscription.next().await.unwrap().unwrap(), "x");
        assert_eq!(subscription.next().await.unwrap().unwrap(), "y");
        assert!(subscription.next().await.is_none());
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn test_failure_delivered_once() {
        let (sender, mut stream) = channel();
        let mut subscription = stream.subscribe().unwrap();
        sender.fail(StratusError::transmission("reset"));

        let first = subscription.next().await.unwrap();
        assert!(matches!(first, Err(StratusError::Transmission(_))));
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_stops_producer_without_error_to_consumer() {
        let (mut sender, mut stream) = channel();
        let mut subscription = stream.subscribe().unwrap();
        subscription.request(1);
        sender.send(Bytes::from_static(b"a")).await.unwrap();

        subscription.cancel();
        assert!(subscription.next().await.is_none());
        assert!(sender.is_cancelled());
        let err = sender.send(Bytes::from_static(b"b")).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropping_unsubscribed_stream_cancels() {
        let (sender, stream) = channel();
        drop(stream);
        assert!(sender.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_producer_fails_stream() {
        let (sender, mut stream) = channel();
        let mut subscription = stream.subscribe().unwrap();
        drop(sender);
        assert!(matches!(
            subscription.next().await,
            Some(Err(StratusError::Transmission(_)))
        ));
    }

    #[tokio::test]
    async fn test_in_memory_source_respects_demand() {
        let mut stream = ByteStream::from_chunks([
            Bytes::from_static(b"ab"),
            Bytes::from_static(b"cd"),
        ]);
        assert_eq!(stream.content_length(), Some(4));
        let mut subscription = stream.subscribe().unwrap();

        let mut next = task::spawn(subscription.next());
        assert_pending!(next.poll());
        drop(next);

        subscription.request(1);
        assert_eq!(subscription.next().await.unwrap().unwrap(), "ab");
        assert_eq!(subscription.pull().await.unwrap().unwrap(), "cd");
        assert!(subscription.pull().await.is_none());
    }

    #[tokio::test]
    async fn test_collect_concatenates() {
        let (mut sender, stream) = channel();
        let producer = tokio::spawn(async move {
            for part in ["he", "ll", "o"] {
                sender.send(Bytes::from(part)).await.unwrap();
            }
            sender.complete();
        });
        assert_eq!(stream.collect().await.unwrap(), "hello");
        producer.await.unwrap();
    }

    struct Uppercase;

    impl ChunkFilter for Uppercase {
        fn name(&self) -> &'static str {
            "uppercase"
        }

        fn on_chunk(&mut self, chunk: Bytes) -> Result<Option<Bytes>, StratusError> {
            Ok(Some(Bytes::from(chunk.to_ascii_uppercase())))
        }
    }

    struct DropOdd {
        index: usize,
    }

    impl ChunkFilter for DropOdd {
        fn name(&self) -> &'static str {
            "drop-odd"
        }

        fn on_chunk(&mut self, chunk: Bytes) -> Result<Option<Bytes>, StratusError> {
            self.index += 1;
            Ok((self.index % 2 == 1).then_some(chunk))
        }

        fn on_complete(&mut self) -> Result<(), StratusError> {
            if self.index == 3 {
                Err(StratusError::decode("odd number of chunks"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_filters_apply_in_order_and_replenish_demand() {
        let stream = ByteStream::from_chunks([
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c"),
            Bytes::from_static(b"d"),
        ])
        .with_filter(DropOdd { index: 0 })
        .with_filter(Uppercase);

        assert_eq!(stream.collect().await.unwrap(), "AC");
    }

    #[tokio::test]
    async fn test_filter_can_fail_completion() {
        let stream = ByteStream::from_chunks([
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c"),
        ])
        .with_filter(DropOdd { index: 0 });

        assert!(matches!(
            stream.collect().await,
            Err(StratusError::ResponseDecode(_))
        ));
    }

    #[tokio::test]
    async fn test_into_stream() {
        use futures::StreamExt;

        let mut stream = ByteStream::from_chunks([Bytes::from_static(b"1"), Bytes::from_static(b"2")]);
        let chunks: Vec<_> = stream
            .subscribe()
            .unwrap()
            .into_stream()
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec![Bytes::from_static(b"1"), Bytes::from_static(b"2")]);
    }
}
