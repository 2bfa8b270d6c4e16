//! Multicast delivery of incoming messages and wire-level taps.
//!
//! The connection reader publishes into a [`Fanout`], which hands each item
//! to every live subscriber over its own unbounded channel. Slow consumers
//! therefore buffer instead of stalling the reader, order is wire-arrival
//! order per subscriber, and closing the fan-out ends every stream instead
//! of leaving it hanging.

use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::mpsc;

use crate::message::AmiMessage;

/// Subscriber registry shared by the client handle and the reader task.
#[derive(Debug)]
pub(crate) struct Fanout<T> {
    inner: Mutex<FanoutInner<T>>,
}

#[derive(Debug)]
struct FanoutInner<T> {
    senders: Vec<mpsc::UnboundedSender<T>>,
    closed: bool,
}

impl<T: Clone> Fanout<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FanoutInner {
                senders: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Open a subscription. After [`Fanout::close`] the channel comes back
    /// already ended, so late subscribers observe end-of-stream rather than
    /// hanging.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("fan-out lock poisoned");
        if !inner.closed {
            inner.senders.push(tx);
        }
        rx
    }

    /// Deliver one item to every live subscriber, pruning dead ones.
    pub fn publish(&self, item: &T) {
        let mut inner = self.inner.lock().expect("fan-out lock poisoned");
        inner.senders.retain(|tx| tx.send(item.clone()).is_ok());
    }

    /// True if anyone is currently subscribed.
    pub fn is_active(&self) -> bool {
        !self
            .inner
            .lock()
            .expect("fan-out lock poisoned")
            .senders
            .is_empty()
    }

    /// End every subscription and reject future ones.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("fan-out lock poisoned");
        inner.closed = true;
        inner.senders.clear();
    }
}

/// Ordered stream of every message received on the session.
///
/// Returned by [`AmiClient::subscribe`](crate::AmiClient::subscribe). Yields
/// messages from the moment of subscription forward, with no history
/// replay, and ends when the session closes. Implements [`Stream`], so the
/// usual combinators (`filter`, `take_while`, `collect`) apply directly.
#[derive(Debug)]
pub struct AmiEventStream {
    rx: mpsc::UnboundedReceiver<AmiMessage>,
}

impl AmiEventStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<AmiMessage>) -> Self {
        Self { rx }
    }

    /// Receive the next message; `None` once the session has closed.
    pub async fn recv(&mut self) -> Option<AmiMessage> {
        self.rx.recv().await
    }
}

impl Stream for AmiEventStream {
    type Item = AmiMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Raw bytes crossing the transport, for diagnostic logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// A chunk written to the transport.
    Sent(Bytes),
    /// A chunk read from the transport.
    Received(Bytes),
}

impl WireEvent {
    /// The raw bytes, regardless of direction.
    pub fn bytes(&self) -> &Bytes {
        match self {
            Self::Sent(bytes) | Self::Received(bytes) => bytes,
        }
    }
}

/// Subscription to raw transport bytes.
///
/// Returned by [`AmiClient::wire_tap`](crate::AmiClient::wire_tap): every
/// chunk written to or read from the transport is mirrored here, with no
/// semantic meaning to the client itself. Ends when the session closes.
#[derive(Debug)]
pub struct WireTap {
    rx: mpsc::UnboundedReceiver<WireEvent>,
}

impl WireTap {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<WireEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next wire event; `None` once the session has closed.
    pub async fn recv(&mut self) -> Option<WireEvent> {
        self.rx.recv().await
    }
}

impl Stream for WireTap {
    type Item = WireEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn fanout_delivers_in_order() {
        let fanout = Fanout::new();
        let mut rx = fanout.subscribe();
        for i in 0..3u32 {
            fanout.publish(&i);
        }
        assert_eq!(rx.recv().await, Some(0));
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[test]
    fn dead_subscribers_are_pruned() {
        let fanout = Fanout::new();
        let rx = fanout.subscribe();
        assert!(fanout.is_active());
        drop(rx);
        fanout.publish(&1u32);
        assert!(!fanout.is_active());
    }

    #[tokio::test]
    async fn close_ends_subscriptions() {
        let fanout = Fanout::new();
        let mut rx = fanout.subscribe();
        fanout.publish(&7u32);
        fanout.close();
        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn subscribe_after_close_is_ended() {
        let fanout: Fanout<u32> = Fanout::new();
        fanout.close();
        let mut rx = fanout.subscribe();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn event_stream_composes_with_combinators() {
        let fanout = Fanout::new();
        let stream = AmiEventStream::new(fanout.subscribe());

        let booted: AmiMessage = [("Event", "FullyBooted")].into_iter().collect();
        let hangup: AmiMessage = [("Event", "Hangup")].into_iter().collect();
        fanout.publish(&booted);
        fanout.publish(&hangup);
        fanout.close();

        let events: Vec<AmiMessage> = stream.collect().await;
        assert_eq!(events, vec![booted, hangup]);
    }

    #[test]
    fn wire_event_exposes_bytes_for_both_directions() {
        let sent = WireEvent::Sent(Bytes::from_static(b"Action: Ping\r\n\r\n"));
        let received = WireEvent::Received(Bytes::from_static(b"Response: Success\r\n\r\n"));
        assert_eq!(&sent.bytes()[..], b"Action: Ping\r\n\r\n");
        assert_eq!(&received.bytes()[..], b"Response: Success\r\n\r\n");
    }
}
