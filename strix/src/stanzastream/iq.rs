// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! IQ correlation and inbound request handling.
//!
//! Outgoing `get`/`set` requests are tracked in a table keyed by the
//! peer's JID and the request id; the matching `result`/`error` settles
//! the caller's [`IqResponseToken`]. Incoming requests are routed to
//! exactly one handler per `(type, payload qname)` tuple; requests nobody
//! handles are answered with `service-unavailable` as RFC 6120 § 8.4
//! demands.

use core::fmt;
use core::future::Future;
use core::ops::ControlFlow;
use core::pin::Pin;
use core::task::{ready, Context, Poll};
use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, Weak};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};

use strix_schema::Element;
use strix_stanzas::iq::{Iq, IqType};
use strix_stanzas::jid::Jid;
use strix_stanzas::stanza_error::StanzaError;

use super::queue::{StanzaState, StanzaToken};

/// An IQ request payload
pub enum IqRequest {
    /// Payload for a `type="get"` request
    Get(Element),

    /// Payload for a `type="set"` request
    Set(Element),
}

impl From<IqRequest> for IqType {
    fn from(other: IqRequest) -> IqType {
        match other {
            IqRequest::Get(v) => Self::Get(v),
            IqRequest::Set(v) => Self::Set(v),
        }
    }
}

/// An IQ response payload
#[derive(Debug)]
pub enum IqResponse {
    /// Payload for a `type="result"` response.
    Result(Option<Element>),

    /// Payload for a `type="error"` response.
    Error(StanzaError),
}

impl From<IqResponse> for IqType {
    fn from(other: IqResponse) -> IqType {
        match other {
            IqResponse::Result(v) => Self::Result(v),
            IqResponse::Error(v) => Self::Error(v),
        }
    }
}

/// Error enumeration for Iq sending failures
#[derive(Debug)]
pub enum IqFailure {
    /// Internal error which caused the stream worker to drop the token
    /// before the response was received.
    ///
    /// Most likely, this means that the stream has died with a panic.
    LostWorker,

    /// The IQ failed to send because of an I/O or serialisation error.
    SendError(io::Error),

    /// The stream was torn down without resumption before a reply
    /// arrived.
    Disconnected,
}

impl fmt::Display for IqFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::LostWorker => {
                f.write_str("disconnected from internal connection worker while sending IQ")
            }
            Self::SendError(e) => write!(f, "send error: {e}"),
            Self::Disconnected => f.write_str("stream disconnected before the reply arrived"),
        }
    }
}

impl std::error::Error for IqFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SendError(ref e) => Some(e),
            _ => None,
        }
    }
}

type IqKey = (Option<Jid>, String);
type IqMap = BTreeMap<IqKey, IqResponseSink>;

struct IqMapEntryHandle {
    key: IqKey,
    map: Weak<Mutex<IqMap>>,
}

impl Drop for IqMapEntryHandle {
    fn drop(&mut self) {
        let Some(map) = self.map.upgrade() else {
            return;
        };
        let Some(mut map) = map.lock().ok() else {
            return;
        };
        map.remove(&self.key);
    }
}

pin_project_lite::pin_project! {
    /// Handle for awaiting an IQ response.
    ///
    /// The `IqResponseToken` can be awaited and will generate a result
    /// once the Iq response has been received. Note that an `Ok(_)`
    /// result does **not** imply a successful execution of the remote
    /// command: It may contain a [`IqResponse::Error`] variant.
    ///
    /// There are no internal timeouts: callers supply their own deadline,
    /// typically with [`tokio::time::timeout`].
    ///
    /// Dropping (cancelling) an `IqResponseToken` detaches the waiter;
    /// the request-table entry itself is removed so that a late reply is
    /// logged and dropped rather than mis-routed.
    pub struct IqResponseToken {
        entry: Option<IqMapEntryHandle>,
        #[pin]
        stanza_token: Option<tokio_stream::wrappers::WatchStream<StanzaState>>,
        #[pin]
        inner: oneshot::Receiver<Result<IqResponse, IqFailure>>,
    }
}

impl IqResponseToken {
    /// Tie a stanza token to this IQ response token.
    ///
    /// The stanza token should point at the IQ **request**, the response
    /// of which this response token awaits.
    pub(crate) fn set_stanza_token(&mut self, token: StanzaToken) {
        assert!(self.stanza_token.is_none());
        self.stanza_token = Some(token.into_stream());
    }
}

impl Future for IqResponseToken {
    type Output = Result<IqResponse, IqFailure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready(Ok(v)) => {
                // Drop the map entry handle to release some memory.
                this.entry.take();
                return Poll::Ready(v);
            }
            Poll::Ready(Err(_)) => {
                log::warn!("IqResponseToken oneshot::Receiver returned receive error!");
                this.entry.take();
                return Poll::Ready(Err(IqFailure::LostWorker));
            }
            Poll::Pending => (),
        };

        loop {
            match this.stanza_token.as_mut().as_pin_mut() {
                // We have a stanza token to look at, so we check its
                // state.
                Some(stream) => match ready!(stream.poll_next(cx)) {
                    // Still in the queue.
                    Some(StanzaState::Queued) => (),

                    Some(StanzaState::Dropped) | Some(StanzaState::Aborted) | None => {
                        log::debug!("stanza associated with IqResponseToken will not be transmitted");
                        this.entry.take();
                        return Poll::Ready(Err(IqFailure::LostWorker));
                    }

                    Some(StanzaState::Disconnected) => {
                        this.entry.take();
                        return Poll::Ready(Err(IqFailure::Disconnected));
                    }

                    Some(StanzaState::Failed { error }) => {
                        this.entry.take();
                        return Poll::Ready(Err(IqFailure::SendError(error.into_io_error())));
                    }

                    Some(StanzaState::Sent { .. })
                    | Some(StanzaState::SentWithoutSm)
                    | Some(StanzaState::Acked { .. }) => {
                        // Sent successfully; from here on the next
                        // progress we expect is this.inner completing.
                        *this.stanza_token = None;
                        return Poll::Pending;
                    }
                },

                // No StanzaToken to poll, so we wait for a response
                // through this.inner.
                None => return Poll::Pending,
            }
        }
    }
}

struct IqResponseSink {
    inner: oneshot::Sender<Result<IqResponse, IqFailure>>,
}

impl IqResponseSink {
    fn complete(self, resp: IqResponse) {
        let _: Result<_, _> = self.inner.send(Ok(resp));
    }

    fn fail(self, failure: IqFailure) {
        let _: Result<_, _> = self.inner.send(Err(failure));
    }
}

/// Utility struct to track IQ responses.
pub struct IqResponseTracker {
    map: Arc<Mutex<IqMap>>,
}

impl IqResponseTracker {
    /// Create a new empty response tracker.
    pub fn new() -> Self {
        Self {
            map: Arc::new(Mutex::new(IqMap::new())),
        }
    }

    /// Attempt to handle an IQ stanza as IQ response.
    ///
    /// Returns the IQ stanza unharmed if it is not an IQ response
    /// matching any request which is still being tracked.
    pub fn handle_iq(&self, iq: Iq) -> ControlFlow<(), Iq> {
        let payload = match iq.payload {
            IqType::Error(error) => IqResponse::Error(error),
            IqType::Result(result) => IqResponse::Result(result),
            _ => return ControlFlow::Continue(iq),
        };
        let key = (iq.from, iq.id);
        let mut map = self.map.lock().unwrap();
        match map.remove(&key) {
            None => {
                log::trace!("not handling IQ response from {:?} with id {:?}: no active tracker for this tuple", key.0, key.1);
                ControlFlow::Continue(Iq {
                    from: key.0,
                    id: key.1,
                    to: iq.to,
                    payload: payload.into(),
                })
            }
            Some(sink) => {
                sink.complete(payload);
                ControlFlow::Break(())
            }
        }
    }

    /// Fail all waiters; used when the stream dies without resumption.
    pub fn fail_all(&self) {
        let mut map = self.map.lock().unwrap();
        while let Some((_, sink)) = map.pop_first() {
            sink.fail(IqFailure::Disconnected);
        }
    }

    /// Allocate a new IQ response tracking handle.
    ///
    /// The id must be unique for the peer; the caller obtains it from the
    /// stream's [`IdGenerator`][`crate::stanza::IdGenerator`].
    pub fn allocate_iq_handle(
        &self,
        from: Option<Jid>,
        to: Option<Jid>,
        id: String,
        req: IqRequest,
    ) -> (Iq, IqResponseToken) {
        let key = (to, id);
        let mut map = self.map.lock().unwrap();
        let (tx, rx) = oneshot::channel();
        let sink = IqResponseSink { inner: tx };
        assert!(map.get(&key).is_none());
        let token = IqResponseToken {
            entry: Some(IqMapEntryHandle {
                key: key.clone(),
                map: Arc::downgrade(&self.map),
            }),
            stanza_token: None,
            inner: rx,
        };
        map.insert(key.clone(), sink);
        (
            Iq {
                from,
                to: key.0,
                id: key.1,
                payload: req.into(),
            },
            token,
        )
    }
}

impl Default for IqResponseTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// The reply produced by an IQ request handler.
#[derive(Debug)]
pub enum IqReply {
    /// Reply with `type="result"`.
    Result(Option<Element>),

    /// Reply with `type="error"`.
    Error(StanzaError),
}

impl IqReply {
    fn into_iq(self, request: &Iq) -> Iq {
        match self {
            IqReply::Result(payload) => Iq::result_of(request, payload),
            IqReply::Error(error) => Iq::error_of(request, error),
        }
    }
}

/// The kind of an inbound IQ request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IqRequestKind {
    /// `type="get"`.
    Get,

    /// `type="set"`.
    Set,
}

/// An inbound request handler.
pub enum IqRequestHandler {
    /// Invoked synchronously on the receive path. Because the XML stream
    /// guarantees ordering, the reply hits the wire before the next
    /// inbound stanza is dispatched.
    Callback(Box<dyn FnMut(&Iq) -> IqReply + Send>),

    /// Scheduled as a separate task; ordering across deferred handlers is
    /// not preserved.
    Deferred(Box<dyn FnMut(Iq, oneshot::Sender<IqReply>) + Send>),
}

type HandlerKey = (IqRequestKind, String, String);

use super::dispatch::HandlerAlreadyRegistered;

/// Registry of inbound IQ request handlers.
///
/// Exactly one handler may exist per `(type, payload qname)` tuple;
/// duplicate registrations are rejected.
pub struct IqHandlerRegistry {
    handlers: BTreeMap<HandlerKey, IqRequestHandler>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl IqHandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
            tasks: Vec::new(),
        }
    }

    /// Register a handler for requests of `kind` carrying a payload with
    /// the given qualified name.
    pub fn register(
        &mut self,
        kind: IqRequestKind,
        ns: &str,
        name: &str,
        handler: IqRequestHandler,
    ) -> Result<(), HandlerAlreadyRegistered> {
        let key = (kind, ns.to_owned(), name.to_owned());
        if self.handlers.contains_key(&key) {
            return Err(HandlerAlreadyRegistered);
        }
        self.handlers.insert(key, handler);
        Ok(())
    }

    /// Remove a handler.
    pub fn unregister(&mut self, kind: IqRequestKind, ns: &str, name: &str) -> bool {
        self.handlers
            .remove(&(kind, ns.to_owned(), name.to_owned()))
            .is_some()
    }

    /// Dispatch an inbound request.
    ///
    /// The reply is delivered through `reply_tx`: immediately for
    /// callback handlers, from a spawned task for deferred ones.
    /// Unhandled requests are answered with `service-unavailable`.
    pub fn dispatch(&mut self, iq: Iq, reply_tx: mpsc::UnboundedSender<Iq>) {
        let kind = match iq.payload {
            IqType::Get(_) => IqRequestKind::Get,
            IqType::Set(_) => IqRequestKind::Set,
            _ => unreachable!("dispatch called with a response IQ"),
        };
        let payload = iq.request_payload().expect("request payload");
        let key = (
            kind,
            payload.ns().to_owned(),
            payload.name().to_owned(),
        );
        match self.handlers.get_mut(&key) {
            Some(IqRequestHandler::Callback(handler)) => {
                let reply = handler(&iq).into_iq(&iq);
                let _: Result<_, _> = reply_tx.send(reply);
            }
            Some(IqRequestHandler::Deferred(handler)) => {
                let (tx, rx) = oneshot::channel();
                handler(iq.clone(), tx);
                let handle = tokio::spawn(async move {
                    let reply = match rx.await {
                        Ok(reply) => reply,
                        // handler dropped the slot; answer with an error
                        // so the peer is not left hanging
                        Err(_) => IqReply::Error(StanzaError::new(
                            strix_stanzas::stanza_error::ErrorType::Cancel,
                            strix_stanzas::stanza_error::DefinedCondition::InternalServerError,
                            "en",
                            "The request handler vanished.",
                        )),
                    };
                    let _: Result<_, _> = reply_tx.send(reply.into_iq(&iq));
                });
                self.tasks.retain(|task| !task.is_finished());
                self.tasks.push(handle);
            }
            None => {
                log::debug!(
                    "no handler for {:?} IQ with payload {{{}}}{}; replying service-unavailable",
                    kind,
                    key.1,
                    key.2
                );
                let _: Result<_, _> = reply_tx.send(Iq::service_unavailable_reply(&iq));
            }
        }
    }

    /// Abort all in-flight deferred handler tasks.
    pub fn cancel_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Default for IqHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use strix_stanzas::ns;
    use strix_stanzas::stanza_error::DefinedCondition;

    fn ping_request(id: &str, from: Option<&str>) -> Iq {
        let mut iq = Iq::from_get(id, Element::bare("ping", ns::PING));
        iq.from = from.map(|s| s.parse().unwrap());
        iq
    }

    #[tokio::test]
    async fn matched_response_settles_waiter() {
        let tracker = IqResponseTracker::new();
        let peer: Jid = "peer@example.net/r".parse().unwrap();
        let (iq, token) = tracker.allocate_iq_handle(
            None,
            Some(peer.clone()),
            "q1".to_owned(),
            IqRequest::Get(Element::bare("ping", ns::PING)),
        );
        assert_eq!(iq.id, "q1");

        let mut reply = Iq::result_of(&iq, None);
        reply.from = Some(peer);
        assert!(matches!(tracker.handle_iq(reply), ControlFlow::Break(())));
        match token.await {
            Ok(IqResponse::Result(None)) => (),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn unmatched_response_is_returned() {
        let tracker = IqResponseTracker::new();
        let reply = Iq {
            from: Some("peer@example.net/r".parse().unwrap()),
            to: None,
            id: "unknown".to_owned(),
            payload: IqType::Result(None),
        };
        assert!(matches!(
            tracker.handle_iq(reply),
            ControlFlow::Continue(_)
        ));
    }

    #[tokio::test]
    async fn dropping_token_detaches_waiter() {
        let tracker = IqResponseTracker::new();
        let peer: Jid = "peer@example.net/r".parse().unwrap();
        let (iq, token) = tracker.allocate_iq_handle(
            None,
            Some(peer.clone()),
            "q2".to_owned(),
            IqRequest::Get(Element::bare("ping", ns::PING)),
        );
        drop(token);
        // the entry is gone, so a late reply is not matched
        let mut reply = Iq::result_of(&iq, None);
        reply.from = Some(peer);
        assert!(matches!(
            tracker.handle_iq(reply),
            ControlFlow::Continue(_)
        ));
    }

    #[tokio::test]
    async fn fail_all_rejects_waiters() {
        let tracker = IqResponseTracker::new();
        let (_iq, token) = tracker.allocate_iq_handle(
            None,
            Some("peer@example.net".parse().unwrap()),
            "q3".to_owned(),
            IqRequest::Get(Element::bare("ping", ns::PING)),
        );
        tracker.fail_all();
        assert!(matches!(token.await, Err(IqFailure::Disconnected)));
    }

    #[tokio::test]
    async fn callback_handler_replies_inline() {
        let mut registry = IqHandlerRegistry::new();
        registry
            .register(
                IqRequestKind::Get,
                ns::PING,
                "ping",
                IqRequestHandler::Callback(Box::new(|_| IqReply::Result(None))),
            )
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.dispatch(ping_request("p1", Some("a@b.example/r")), tx);
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.id, "p1");
        assert!(matches!(reply.payload, IqType::Result(None)));
    }

    #[tokio::test]
    async fn deferred_handler_replies_from_task() {
        let mut registry = IqHandlerRegistry::new();
        registry
            .register(
                IqRequestKind::Get,
                ns::PING,
                "ping",
                IqRequestHandler::Deferred(Box::new(|_iq, slot| {
                    tokio::spawn(async move {
                        let _: Result<_, _> = slot.send(IqReply::Result(None));
                    });
                })),
            )
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.dispatch(ping_request("p2", Some("a@b.example/r")), tx);
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.id, "p2");
    }

    #[tokio::test]
    async fn unhandled_request_gets_service_unavailable() {
        let mut registry = IqHandlerRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.dispatch(
            Iq::from_get("u1", Element::bare("x", "urn:example:unregistered")),
            tx,
        );
        let reply = rx.recv().await.unwrap();
        match reply.payload {
            IqType::Error(error) => {
                assert_eq!(error.defined_condition, DefinedCondition::ServiceUnavailable);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn duplicate_handler_rejected() {
        let mut registry = IqHandlerRegistry::new();
        registry
            .register(
                IqRequestKind::Get,
                ns::PING,
                "ping",
                IqRequestHandler::Callback(Box::new(|_| IqReply::Result(None))),
            )
            .unwrap();
        assert!(registry
            .register(
                IqRequestKind::Get,
                ns::PING,
                "ping",
                IqRequestHandler::Callback(Box::new(|_| IqReply::Result(None))),
            )
            .is_err());
        // same payload under a different type is fine
        assert!(registry
            .register(
                IqRequestKind::Set,
                ns::PING,
                "ping",
                IqRequestHandler::Callback(Box::new(|_| IqReply::Result(None))),
            )
            .is_ok());
    }
}
