//! Pull-controlled streaming: demand accounting, subscriber contract and
//! the bridge between push-style producers and the wire.
//!
//! The only way data flows on a stream is in response to demand. A producer
//! holds a [`StreamSink`] whose `send` suspends until the consumer has
//! requested an item; the transport side holds a [`ReplyStream`] that
//! forwards consumer demand in and carries encoded frames out. Exactly one
//! terminal signal is delivered per stream; anything after it is logged and
//! dropped.

use crate::codec::{encode_reply, Encoding};
use crate::error::{CallError, ErrorRecord};
use crate::schema::WireType;
use bytes::Bytes;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

/// Outstanding-demand counter shared between one consumer and one producer.
///
/// `add` saturates at `u64::MAX` instead of overflowing; `acquire` suspends
/// until an item of demand is available or the stream is cancelled.
#[derive(Debug, Default)]
pub struct Demand {
    remaining: AtomicU64,
    cancelled: AtomicBool,
    notify: Notify,
}

impl Demand {
    pub fn new() -> Arc<Self> {
        Arc::new(Demand::default())
    }

    /// Grant `n` more items of demand. Zero is a no-op.
    pub fn add(&self, n: u64) {
        if n == 0 {
            tracing::debug!("request(0) ignored");
            return;
        }
        let _ = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                Some(r.saturating_add(n))
            });
        self.notify.notify_waiters();
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn outstanding(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Take one item of demand, waiting for it to be granted. Returns
    /// `false` once the stream is cancelled.
    pub async fn acquire(&self) -> bool {
        loop {
            // Register interest before checking, so a grant between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return false;
            }
            if self
                .remaining
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1))
                .is_ok()
            {
                return true;
            }
            notified.await;
        }
    }
}

/// Where consumer demand signals go. Implemented by [`Demand`] for local
/// streams and by transport adapters that relay demand across the wire.
pub trait DemandSink: Send + Sync {
    fn request(&self, n: u64);
    fn cancel(&self);
}

impl DemandSink for Demand {
    fn request(&self, n: u64) {
        self.add(n);
    }

    fn cancel(&self) {
        Demand::cancel(self);
    }
}

/// The pull-control handle handed to a subscriber.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<dyn DemandSink>,
}

impl Subscription {
    pub fn new(inner: Arc<dyn DemandSink>) -> Self {
        Subscription { inner }
    }

    /// Demand `n` additional items; totals saturate rather than overflow.
    pub fn request(&self, n: u64) {
        self.inner.request(n);
    }

    /// Terminate the stream early and release producer-side state.
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Subscription")
    }
}

/// Consumer of a stream call's items.
pub trait Subscriber<T>: Send + 'static {
    fn on_subscribe(&mut self, subscription: Subscription);
    fn on_next(&mut self, item: T);
    fn on_error(&mut self, error: CallError);
    fn on_complete(&mut self);
}

/// One encoded frame of a streamed reply. `Item` and `Error` payloads are
/// both full reply records, each independently decodable.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    Item(Bytes),
    Error(Bytes),
    Complete,
}

/// The stream was cancelled by the consumer or its transport went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stream cancelled or closed")]
pub struct StreamClosed;

/// Producer handle given to stream method handlers.
///
/// `send` respects demand: it suspends until the consumer has requested an
/// item, so a well-behaved handler can never run ahead of the subscriber.
pub struct StreamSink<T> {
    demand: Arc<Demand>,
    tx: mpsc::UnboundedSender<StreamFrame>,
    terminated: Arc<AtomicBool>,
    encoding: Encoding,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for StreamSink<T> {
    fn clone(&self) -> Self {
        StreamSink {
            demand: Arc::clone(&self.demand),
            tx: self.tx.clone(),
            terminated: Arc::clone(&self.terminated),
            encoding: self.encoding,
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for StreamSink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSink")
            .field("outstanding", &self.demand.outstanding())
            .finish()
    }
}

impl<T: WireType> StreamSink<T> {
    /// Emit one item, waiting for demand first.
    pub async fn send(&self, item: T) -> Result<(), StreamClosed> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(StreamClosed);
        }
        if !self.demand.acquire().await {
            return Err(StreamClosed);
        }
        let frame = StreamFrame::Item(encode_reply(Ok(&item), self.encoding));
        self.tx.send(frame).map_err(|_| StreamClosed)
    }

    /// Close the stream normally.
    pub fn complete(&self) {
        self.terminal(StreamFrame::Complete);
    }

    /// Close the stream with an error record.
    pub fn error(&self, record: ErrorRecord) {
        let frame = StreamFrame::Error(encode_reply::<T>(Err(&record), self.encoding));
        self.terminal(frame);
    }

    pub fn is_cancelled(&self) -> bool {
        self.demand.is_cancelled()
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    fn terminal(&self, frame: StreamFrame) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            // One terminal signal per stream; a second is a producer bug,
            // logged and dropped.
            tracing::debug!("duplicate stream terminal signal ignored");
            return;
        }
        let _ = self.tx.send(frame);
    }
}

/// Transport-facing end of a server stream: demand goes in, ordered encoded
/// frames come out, ending with exactly one `Complete` or `Error`.
#[derive(Debug)]
pub struct ReplyStream {
    demand: Arc<Demand>,
    rx: mpsc::UnboundedReceiver<StreamFrame>,
}

impl ReplyStream {
    pub fn request(&self, n: u64) {
        self.demand.add(n);
    }

    pub fn cancel(&self) {
        self.demand.cancel();
    }

    pub fn demand(&self) -> Arc<Demand> {
        Arc::clone(&self.demand)
    }

    /// Next frame, `None` once the producer side is gone.
    pub async fn next_frame(&mut self) -> Option<StreamFrame> {
        self.rx.recv().await
    }
}

/// A dropped consumer is a cancellation: a producer suspended in `send`
/// must not outlive the transport that was carrying its stream.
impl Drop for ReplyStream {
    fn drop(&mut self) {
        self.demand.cancel();
    }
}

/// A connected producer/consumer pair for one stream call.
pub fn stream_pair<T: WireType>(encoding: Encoding) -> (StreamSink<T>, ReplyStream) {
    let demand = Demand::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = StreamSink {
        demand: Arc::clone(&demand),
        tx,
        terminated: Arc::new(AtomicBool::new(false)),
        encoding,
        _marker: PhantomData,
    };
    (sink, ReplyStream { demand, rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_reply;
    use std::time::Duration;

    #[test]
    fn demand_saturates_instead_of_overflowing() {
        let demand = Demand::new();
        demand.add(u64::MAX - 1);
        demand.add(100);
        assert_eq!(demand.outstanding(), u64::MAX);
    }

    #[tokio::test]
    async fn send_waits_for_demand() {
        let (sink, stream) = stream_pair::<String>(Encoding::Json);
        let send = sink.send("early".to_string());
        tokio::pin!(send);
        // No demand granted: the send must still be pending.
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut send)
            .await
            .is_err());
        stream.request(1);
        assert!(send.await.is_ok());
    }

    #[tokio::test]
    async fn dropping_the_consumer_releases_a_blocked_producer() {
        let (sink, stream) = stream_pair::<String>(Encoding::Json);
        let producer = tokio::spawn(async move { sink.send("pending".to_string()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(stream);
        assert_eq!(producer.await.unwrap(), Err(StreamClosed));
    }

    #[tokio::test]
    async fn cancel_releases_a_blocked_producer() {
        let (sink, stream) = stream_pair::<String>(Encoding::Json);
        let handle = tokio::spawn(async move { sink.send("never".to_string()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.cancel();
        assert_eq!(handle.await.unwrap(), Err(StreamClosed));
    }

    #[tokio::test]
    async fn only_one_terminal_signal_is_delivered() {
        let (sink, mut stream) = stream_pair::<String>(Encoding::Json);
        sink.complete();
        sink.error(ErrorRecord::new(Some("late".to_string()), "Late"));
        sink.complete();
        assert!(matches!(stream.next_frame().await, Some(StreamFrame::Complete)));
        drop(sink);
        assert!(stream.next_frame().await.is_none());
    }

    /// The demand-discipline scenario: a producer of items 0..6 and a
    /// subscriber requesting 3, then 2, then 1, then an oversized 101 must
    /// observe subscribe-marker, the items in order, completion-marker,
    /// with no item ever delivered ahead of outstanding demand.
    #[tokio::test]
    async fn demand_discipline_preserves_order_and_markers() {
        let (sink, mut stream) = stream_pair::<String>(Encoding::Json);

        let producer = tokio::spawn(async move {
            for i in 0..6 {
                if sink.send(i.to_string()).await.is_err() {
                    return;
                }
            }
            sink.complete();
        });

        let mut received: Vec<i64> = Vec::new();
        received.push(-1); // subscribe marker
        stream.request(3);
        let mut round = 1;
        while let Some(frame) = stream.next_frame().await {
            match frame {
                StreamFrame::Item(bytes) => {
                    let item = decode_reply::<String>(&bytes, Encoding::Json)
                        .unwrap()
                        .unwrap();
                    received.push(item.parse().unwrap());
                    match round {
                        1 => stream.request(2),
                        2 => stream.request(1),
                        _ => stream.request(101),
                    }
                    round += 1;
                }
                StreamFrame::Complete => {
                    received.push(-2);
                    break;
                }
                StreamFrame::Error(_) => panic!("unexpected error frame"),
            }
        }

        producer.await.unwrap();
        assert_eq!(received, vec![-1, 0, 1, 2, 3, 4, 5, -2]);
    }
}
