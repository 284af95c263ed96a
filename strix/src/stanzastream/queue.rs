// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::cmp::Ordering;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use core::task::{Context, Poll};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use futures::ready;

use tokio::sync::{mpsc, watch};

use crate::stanza::Stanza;

/// Clonable, inspectable I/O error for fanning one failure out to many
/// stanza tokens.
#[derive(Debug, Clone)]
pub struct OpaqueIoError {
    kind: io::ErrorKind,
    message: String,
}

impl OpaqueIoError {
    /// The error kind.
    pub fn kind(&self) -> io::ErrorKind {
        self.kind
    }

    /// Convert into a plain [`io::Error`].
    pub fn into_io_error(self) -> io::Error {
        io::Error::new(self.kind, self.message)
    }

    /// Create a plain [`io::Error`] without consuming self.
    pub fn to_io_error(&self) -> io::Error {
        io::Error::new(self.kind, self.message.clone())
    }
}

impl From<io::Error> for OpaqueIoError {
    fn from(other: io::Error) -> Self {
        <Self as From<&io::Error>>::from(&other)
    }
}

impl From<&io::Error> for OpaqueIoError {
    fn from(other: &io::Error) -> Self {
        Self {
            kind: other.kind(),
            message: other.to_string(),
        }
    }
}

impl fmt::Display for OpaqueIoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for OpaqueIoError {}

/// The stages of stanza transmission, in progression order.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum StanzaStage {
    /// The stanza is in the transmit queue, but has not been serialised
    /// or sent to the stream yet.
    Queued,

    /// The stanza was successfully serialised and put into the transmit
    /// buffers.
    Sent,

    /// The stanza was put on the wire of a stream without stream
    /// management; whether the server received it is unknowable.
    SentWithoutSm,

    /// The stanza has been acked by the peer using XEP-0198, i.e. it was
    /// delivered to the server.
    Acked,

    /// Stanza transmission or serialisation failed.
    Failed,

    /// The stanza was dropped from the transmit queue before it could be
    /// sent.
    Dropped,

    /// The stream died without resumption while the stanza was unacked;
    /// the outcome is unknown.
    Disconnected,

    /// The stanza was aborted by its sender.
    Aborted,
}

impl From<&StanzaState> for StanzaStage {
    fn from(other: &StanzaState) -> Self {
        match other {
            StanzaState::Queued => Self::Queued,
            StanzaState::Sent { .. } => Self::Sent,
            StanzaState::SentWithoutSm => Self::SentWithoutSm,
            StanzaState::Acked { .. } => Self::Acked,
            StanzaState::Failed { .. } => Self::Failed,
            StanzaState::Dropped => Self::Dropped,
            StanzaState::Disconnected => Self::Disconnected,
            StanzaState::Aborted => Self::Aborted,
        }
    }
}

impl PartialEq<StanzaStage> for StanzaState {
    fn eq(&self, other: &StanzaStage) -> bool {
        StanzaStage::from(self).eq(other)
    }
}

impl PartialEq<StanzaState> for StanzaStage {
    fn eq(&self, other: &StanzaState) -> bool {
        self.eq(&Self::from(other))
    }
}

impl PartialOrd<StanzaStage> for StanzaState {
    fn partial_cmp(&self, other: &StanzaStage) -> Option<Ordering> {
        StanzaStage::from(self).partial_cmp(other)
    }
}

impl PartialOrd<StanzaState> for StanzaStage {
    fn partial_cmp(&self, other: &StanzaState) -> Option<Ordering> {
        self.partial_cmp(&Self::from(other))
    }
}

impl StanzaStage {
    /// Whether no further transitions can happen from this stage.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Acked | Self::Failed | Self::Dropped | Self::Aborted
        )
    }
}

/// State of a stanza in transit to the peer.
#[derive(Debug, Clone)]
pub enum StanzaState {
    /// The stanza has been enqueued in the local queue but not sent yet.
    Queued,

    /// The stanza has been sent to the server, but there is no proof that
    /// it has been received by the server yet.
    Sent {},

    /// The stanza was sent on a stream without stream management; there
    /// will never be proof of receipt.
    SentWithoutSm,

    /// Confirmation that the stanza has been seen by the server has been
    /// received, i.e. the stanza was delivered to the server.
    Acked {},

    /// Sending the stanza has failed in a non-recoverable manner.
    Failed {
        /// The error which caused the sending to fail.
        error: OpaqueIoError,
    },

    /// The stanza was dropped out of the queue for unspecified reasons,
    /// such as the stream breaking in a fatal, panick-y way.
    Dropped,

    /// The stream was torn down without resumption while this stanza was
    /// in flight; the stanza may or may not have reached the server.
    Disconnected,

    /// The sender aborted transmission of this stanza.
    Aborted,
}

/// Track stanza transmission through the
/// [`StanzaStream`][`super::StanzaStream`] up to the peer.
#[derive(Clone)]
pub struct StanzaToken {
    inner: watch::Receiver<StanzaState>,
    abort_flag: Arc<AtomicBool>,
}

impl StanzaToken {
    /// Wait for the stanza transmission to reach the given state.
    ///
    /// If the stanza is removed from tracking before that state is
    /// reached, `None` is returned.
    pub async fn wait_for(&mut self, state: StanzaStage) -> Option<StanzaState> {
        self.inner
            .wait_for(|st| *st >= state)
            .await
            .map(|x| x.clone())
            .ok()
    }

    pub(crate) fn into_stream(self) -> tokio_stream::wrappers::WatchStream<StanzaState> {
        tokio_stream::wrappers::WatchStream::new(self.inner)
    }

    /// Read the current transmission state.
    pub fn state(&self) -> StanzaState {
        self.inner.borrow().clone()
    }

    /// Request that the stanza not be sent.
    ///
    /// Taking effect is asynchronous: a stanza which has not been
    /// serialised yet will be skipped and marked
    /// [`Aborted`][`StanzaState::Aborted`]; a stanza already on the wire
    /// is not un-sent, but a later delivery confirmation will record
    /// `Aborted` instead of `Acked`.
    pub fn abort(&self) {
        self.abort_flag.store(true, AtomicOrdering::SeqCst);
    }
}

pub(super) struct QueueEntry {
    pub stanza: Box<Stanza>,
    pub token: watch::Sender<StanzaState>,
    pub abort_flag: Arc<AtomicBool>,
}

impl QueueEntry {
    pub fn untracked(st: Box<Stanza>) -> Self {
        Self::tracked(st).0
    }

    pub fn tracked(st: Box<Stanza>) -> (Self, StanzaToken) {
        let (tx, rx) = watch::channel(StanzaState::Queued);
        let abort_flag = Arc::new(AtomicBool::new(false));
        let token = StanzaToken {
            inner: rx,
            abort_flag: abort_flag.clone(),
        };
        (
            QueueEntry {
                stanza: st,
                token: tx,
                abort_flag,
            },
            token,
        )
    }

    /// Whether the sender has requested an abort.
    pub fn aborted(&self) -> bool {
        self.abort_flag.load(AtomicOrdering::SeqCst)
    }
}

/// Reference to a transmit queue entry.
///
/// On drop, the entry is returned to the queue.
pub(super) struct TransmitQueueRef<'x, T> {
    q: &'x mut VecDeque<T>,
}

impl<'x, T> TransmitQueueRef<'x, T> {
    /// Take the item out of the queue.
    pub fn take(self) -> T {
        // Unwrap: when this type is created, a check is made that the
        // queue actually has a front item and because we borrow, that
        // also cannot change.
        self.q.pop_front().unwrap()
    }
}

/// A transmit queue coupled to an [`mpsc::Receiver`].
///
/// The transmit queue will by default only allow one element to reside in
/// the queue outside the inner `Receiver`: the main queueing happens
/// inside the receiver and is governed by its queue depth and associated
/// backpressure.
///
/// However, the queue does allow prepending elements to the front, which
/// is useful for retransmitting items.
pub(super) struct TransmitQueue<T: Unpin> {
    inner: mpsc::Receiver<T>,
    peek: VecDeque<T>,
}

impl<T: Unpin> TransmitQueue<T> {
    /// Create a new transmission queue around an existing mpsc receiver.
    pub fn wrap(ch: mpsc::Receiver<T>) -> Self {
        Self {
            inner: ch,
            peek: VecDeque::with_capacity(1),
        }
    }

    /// Create a new mpsc channel and wrap the receiving side in a
    /// transmission queue.
    pub fn channel(depth: usize) -> (mpsc::Sender<T>, Self) {
        let (tx, rx) = mpsc::channel(depth);
        (tx, Self::wrap(rx))
    }

    /// Poll the queue for the next item to transmit.
    pub fn poll_next(&mut self, cx: &mut Context) -> Poll<Option<TransmitQueueRef<'_, T>>> {
        if self.peek.len() > 0 {
            // Cannot use `if let Some(.) = .` here because of a
            // borrowchecker restriction; see
            // https://github.com/rust-lang/rust/issues/54663.
            return Poll::Ready(Some(TransmitQueueRef { q: &mut self.peek }));
        } else {
            // The target size for the queue is 1, effectively acting as
            // an Option<T>. In some cases, we need more than one, but
            // that is always only a temporary burst (e.g. SM resumption
            // retransmissions), so we release the memory as soon as
            // possible after that.
            if self.peek.capacity() > 32 {
                let mut new = VecDeque::new();
                core::mem::swap(&mut self.peek, &mut new);
            }
        }
        match ready!(self.inner.poll_recv(cx)) {
            None => Poll::Ready(None),
            Some(v) => {
                self.peek.push_back(v);
                Poll::Ready(Some(TransmitQueueRef { q: &mut self.peek }))
            }
        }
    }

    /// Requeue a sequence of items to the front of the queue.
    ///
    /// This function preserves ordering of the elements in `iter`,
    /// meaning that the first item from `iter` is going to be the next
    /// item yielded by `poll_next`.
    pub fn requeue_all<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        let iter = iter.into_iter();
        let to_reserve = iter.size_hint().1.unwrap_or(iter.size_hint().0);
        self.peek.reserve(to_reserve);
        let mut n = 0;
        for item in iter {
            self.peek.push_front(item);
            n += 1;
        }
        // Now we need to revert the order: we pushed the elements to the
        // front, so if we now read back from the front via poll_next,
        // that will cause them to be read in reverse order. The following
        // loop fixes that.
        for i in 0..(n / 2) {
            let j = n - (i + 1);
            self.peek.swap(i, j);
        }
    }

    /// Enqueues an item to be sent after all items in the *local* queue,
    /// but *before* all items which are still inside the inner `mpsc`
    /// channel.
    pub fn enqueue(&mut self, item: T) {
        self.peek.push_back(item);
    }

    /// Return true if the sender side of the queue is closed.
    ///
    /// Note that there may still be items which can be retrieved from the
    /// queue even though it has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl TransmitQueue<QueueEntry> {
    /// Fail all currently queued items with the given error.
    ///
    /// Future items will not be affected.
    pub fn fail(&mut self, error: &OpaqueIoError) {
        for item in self.peek.drain(..) {
            item.token.send_replace(StanzaState::Failed {
                error: error.clone(),
            });
        }
        while let Ok(item) = self.inner.try_recv() {
            item.token.send_replace(StanzaState::Failed {
                error: error.clone(),
            });
        }
        self.peek.shrink_to(1);
    }

    /// Mark all currently queued items as disconnected and drop them.
    ///
    /// Used when the stream is torn down without resumption.
    pub fn disconnect_all(&mut self) {
        for item in self.peek.drain(..) {
            item.token.send_replace(StanzaState::Disconnected);
        }
        while let Ok(item) = self.inner.try_recv() {
            item.token.send_replace(StanzaState::Disconnected);
        }
        self.peek.shrink_to(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use strix_schema::Element;
    use strix_stanzas::iq::Iq;

    fn dummy_stanza() -> Box<Stanza> {
        Box::new(Stanza::Iq(Iq::from_get(
            "t1",
            Element::bare("ping", "urn:xmpp:ping"),
        )))
    }

    fn poll_take(queue: &mut TransmitQueue<QueueEntry>) -> Option<QueueEntry> {
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        match queue.poll_next(&mut cx) {
            Poll::Ready(Some(entry)) => Some(entry.take()),
            Poll::Ready(None) => None,
            Poll::Pending => None,
        }
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let (tx, mut queue) = TransmitQueue::channel(16);
        for i in 0..3 {
            let (entry, _token) = QueueEntry::tracked(Box::new(Stanza::Iq(Iq::from_get(
                format!("id-{}", i),
                Element::bare("ping", "urn:xmpp:ping"),
            ))));
            tx.send(entry).await.unwrap();
        }
        for i in 0..3 {
            let entry = poll_take(&mut queue).unwrap();
            match *entry.stanza {
                Stanza::Iq(ref iq) => assert_eq!(iq.id, format!("id-{}", i)),
                ref other => panic!("unexpected stanza: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn requeue_preserves_order() {
        let (_tx, mut queue) = TransmitQueue::<u32>::channel(4);
        queue.requeue_all(vec![1, 2, 3]);
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        for expected in [1u32, 2, 3] {
            match queue.poll_next(&mut cx) {
                Poll::Ready(Some(item)) => assert_eq!(item.take(), expected),
                other => panic!("unexpected poll result: {:?}", other.map(|_| ())),
            }
        }
    }

    #[tokio::test]
    async fn local_enqueue_jumps_channel_backlog() {
        let (tx, mut queue) = TransmitQueue::<u32>::channel(4);
        tx.send(10).await.unwrap();
        queue.enqueue(99);
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        match queue.poll_next(&mut cx) {
            Poll::Ready(Some(item)) => assert_eq!(item.take(), 99),
            other => panic!("unexpected poll result: {:?}", other.map(|_| ())),
        }
        match queue.poll_next(&mut cx) {
            Poll::Ready(Some(item)) => assert_eq!(item.take(), 10),
            other => panic!("unexpected poll result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn fail_reaches_queued_tokens() {
        let (tx, mut queue) = TransmitQueue::channel(16);
        let (entry, token) = QueueEntry::tracked(dummy_stanza());
        tx.send(entry).await.unwrap();
        queue.fail(&io::Error::new(io::ErrorKind::BrokenPipe, "gone").into());
        assert!(matches!(token.state(), StanzaState::Failed { .. }));
    }

    #[tokio::test]
    async fn disconnect_all_marks_tokens() {
        let (tx, mut queue) = TransmitQueue::channel(16);
        let (entry, token) = QueueEntry::tracked(dummy_stanza());
        tx.send(entry).await.unwrap();
        queue.disconnect_all();
        assert!(matches!(token.state(), StanzaState::Disconnected));
    }

    #[test]
    fn abort_flag_is_shared() {
        let (entry, token) = QueueEntry::tracked(dummy_stanza());
        assert!(!entry.aborted());
        token.abort();
        assert!(entry.aborted());
    }

    #[test]
    fn stage_ordering() {
        assert!(StanzaStage::Queued < StanzaStage::Sent);
        assert!(StanzaStage::Sent < StanzaStage::Acked);
        assert!(StanzaState::Queued < StanzaStage::Sent);
        assert!(StanzaStage::Acked.is_terminal());
        assert!(!StanzaStage::Sent.is_terminal());
    }
}
