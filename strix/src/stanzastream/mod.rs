// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Resilient stanza stream
//!
//! This module provides the [`StanzaStream`], which is the next level up
//! from the low-level [`XmlStream`][`crate::xmlstream::XmlStream`].
//!
//! The stanza stream knows about XMPP and it most importantly knows how
//! to fix a broken connection with a reconnect and how to do this
//! smoothly using XEP-0198 (Stream Management). XEP-0198 is only used if
//! the peer supports it. If the peer does not support XEP-0198, automatic
//! reconnects are still done, but with more undetectable data loss.
//!
//! Logically, the stream walks DISCONNECTED → CONNECTING → RUNNING and
//! falls back to SUSPENDED (resumable loss of transport) or TERMINATED.
//! Those states are not exposed as an enum; they materialise as the
//! [`StreamEvent`]s emitted by the stream and as the behaviour of
//! [`send`][`StanzaStream::send`], which parks while the stream is
//! suspended and fails once it is terminated.

use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use std::sync::{Arc, Mutex};

use futures::Stream;

use tokio::sync::{mpsc, oneshot};

use strix_schema::registry::{Carrier, PayloadRegistry};
use strix_stanzas::jid::Jid;

use crate::error::Error;
use crate::stanza::{IdGenerator, Stanza};

mod connected;
mod dispatch;
mod filter;
mod iq;
mod negotiation;
mod queue;
mod stream_management;
mod worker;

pub use self::dispatch::{HandlerAlreadyRegistered, MessageDispatcher, PresenceDispatcher};
pub use self::filter::{DirectionFilters, FilterChain, FilterFn, FilterToken, StreamFilters};
pub use self::iq::{
    IqFailure, IqHandlerRegistry, IqReply, IqRequest, IqRequestHandler, IqRequestKind,
    IqResponse, IqResponseToken, IqResponseTracker,
};
pub use self::queue::{StanzaStage, StanzaState, StanzaToken};
pub use self::stream_management::SmSnapshot;
pub use self::worker::{Connection, Reconnector, XmppStream};

use self::queue::QueueEntry;
use self::worker::StanzaStreamWorker;

/// Event informing about the change of the [`StanzaStream`]'s status.
#[derive(Debug)]
pub enum StreamEvent {
    /// The stream was (re-)established **with** loss of state.
    Reset {
        /// The new JID to which the stream is bound.
        bound_jid: Jid,
    },

    /// The stream is currently inactive because a connection was lost.
    ///
    /// Resumption without loss of state is still possible. This event is
    /// merely informative and may be used to prolong timeouts or inform
    /// the user that the connection is currently unstable.
    Suspended,

    /// The stream was reestablished **without** loss of state.
    Resumed,
}

/// Event emitted by the [`StanzaStream`].
///
/// Note that stream closure is not an explicit event, but the end of the
/// event stream itself.
#[derive(Debug)]
pub enum Event {
    /// The stream's connectivity status has changed.
    Stream(StreamEvent),

    /// A stanza was received over the stream and not consumed by any
    /// registered handler.
    Stanza(Stanza),
}

/// Shared mutable surface between the stream frontend, its worker and the
/// services: filter chains, dispatchers, the IQ machinery and the payload
/// registry.
pub(crate) struct Hooks {
    pub(crate) filters: Mutex<filter::StreamFilters>,
    pub(crate) iq_tracker: iq::IqResponseTracker,
    pub(crate) iq_handlers: Mutex<iq::IqHandlerRegistry>,
    pub(crate) messages: Mutex<dispatch::MessageDispatcher>,
    pub(crate) presences: Mutex<dispatch::PresenceDispatcher>,
    pub(crate) registry: Mutex<PayloadRegistry>,
    pub(crate) ids: IdGenerator,
    pub(crate) sm_snapshot: Mutex<Option<SmSnapshot>>,
}

impl Hooks {
    fn new(registry: PayloadRegistry) -> Hooks {
        Hooks {
            filters: Mutex::new(filter::StreamFilters::new()),
            iq_tracker: iq::IqResponseTracker::new(),
            iq_handlers: Mutex::new(iq::IqHandlerRegistry::new()),
            messages: Mutex::new(dispatch::MessageDispatcher::new()),
            presences: Mutex::new(dispatch::PresenceDispatcher::new()),
            registry: Mutex::new(registry),
            ids: IdGenerator::new(),
            sm_snapshot: Mutex::new(None),
        }
    }
}

/// Clonable sending handle to a [`StanzaStream`], used by services.
#[derive(Clone)]
pub struct StanzaSender {
    tx: mpsc::Sender<QueueEntry>,
}

impl StanzaSender {
    /// Send a stanza; see [`StanzaStream::send`].
    pub async fn send(&self, stanza: Box<Stanza>) -> Result<StanzaToken, Error> {
        let (queue_entry, token) = QueueEntry::tracked(stanza);
        match self.tx.send(queue_entry).await {
            Ok(()) => Ok(token),
            Err(mpsc::error::SendError(entry)) => {
                entry.token.send_replace(StanzaState::Dropped);
                Err(Error::Disconnected)
            }
        }
    }
}

pub(crate) async fn send_iq_inner(
    hooks: &Arc<Hooks>,
    tx: &StanzaSender,
    to: Option<Jid>,
    req: IqRequest,
) -> Result<IqResponseToken, Error> {
    {
        let registry = hooks.registry.lock().unwrap();
        let payload = match &req {
            IqRequest::Get(payload) | IqRequest::Set(payload) => payload,
        };
        registry.check_outbound(Carrier::Iq, payload)?;
    }
    let id = hooks.ids.next_id();
    let (iq, mut token) = hooks.iq_tracker.allocate_iq_handle(None, to, id, req);
    let stanza_token = tx.send(Box::new(Stanza::Iq(iq))).await?;
    token.set_stanza_token(stanza_token);
    Ok(token)
}

/// Frontend interface to a reliable, always-online stanza stream.
pub struct StanzaStream {
    rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<QueueEntry>,
    hooks: Arc<Hooks>,
}

impl StanzaStream {
    /// Create a new stanza stream.
    ///
    /// Stanza streams operate using a `connector` which is responsible
    /// for producing a new stream whenever necessary. It is the
    /// connector's responsibility that:
    ///
    /// - It never fails to send to the channel it is given. If the
    ///   connector drops the channel, the `StanzaStream` will consider
    ///   this fatal and fail the stream.
    ///
    /// - All streams are authenticated and secured as necessary.
    ///
    /// - All streams are authenticated for the same entity. If the
    ///   connector were to provide streams for different identities,
    ///   information leaks could occur as queues from previous sessions
    ///   are being flushed on the new stream on a reconnect.
    ///
    /// Most notably, the `connector` is **not** responsible for
    /// performing resource binding: Resource binding is handled by the
    /// `StanzaStream`.
    ///
    /// `connector` will be called soon after `new()` was called to
    /// establish the first underlying stream for the `StanzaStream`.
    ///
    /// The `queue_depth` controls the sizes for the incoming and outgoing
    /// stanza queues. If the size is exceeded, the corresponding
    /// direction will block until the queues can be flushed.
    ///
    /// `resumption_window` bounds the time across which a resumption is
    /// attempted after a transport loss; `None` disables resumption
    /// entirely while still allowing fresh-session reconnects.
    pub fn new(
        connector: Reconnector,
        queue_depth: usize,
        resumption_window: Option<Duration>,
        registry: PayloadRegistry,
    ) -> Self {
        let hooks = Arc::new(Hooks::new(registry));
        // c2f = core to frontend, f2c = frontend to core
        let (f2c_tx, c2f_rx) =
            StanzaStreamWorker::spawn(connector, queue_depth, hooks.clone(), resumption_window);
        Self {
            tx: f2c_tx,
            rx: c2f_rx,
            hooks,
        }
    }

    pub(crate) fn hooks(&self) -> &Arc<Hooks> {
        &self.hooks
    }

    /// A clonable handle for sending stanzas from services and tasks.
    pub fn sender(&self) -> StanzaSender {
        StanzaSender {
            tx: self.tx.clone(),
        }
    }

    /// Close the stream.
    ///
    /// This will initiate a clean shutdown of the stream and will prevent
    /// and cancel any more reconnection attempts.
    pub async fn close(mut self) {
        drop(self.tx); // closes stream.
        while let Some(ev) = self.rx.recv().await {
            log::trace!("discarding event {:?} after stream closure", ev);
        }
    }

    /// Send a stanza via the stream.
    ///
    /// Completion of this function merely signals that the stanza has
    /// been enqueued successfully: it may be stuck in the transmission
    /// queue for quite a while if the stream is currently disconnected.
    /// The transmission progress can be observed via the returned
    /// [`StanzaToken`].
    ///
    /// While the stream is suspended, this call parks until the stream is
    /// running again (or until the queue has room); once the stream has
    /// been terminated, it fails with
    /// [`Error::Disconnected`].
    pub async fn send(&self, stanza: Box<Stanza>) -> Result<StanzaToken, Error> {
        self.sender().send(stanza).await
    }

    /// Send an IQ request and obtain a token to await the reply.
    ///
    /// The request payload must be registered for the IQ carrier in the
    /// stream's [`PayloadRegistry`]; unregistered payloads fail before
    /// anything is enqueued. No deadline is applied; combine the returned
    /// token with [`tokio::time::timeout`] as needed.
    pub async fn send_iq(
        &self,
        to: Option<Jid>,
        req: IqRequest,
    ) -> Result<IqResponseToken, Error> {
        send_iq_inner(&self.hooks, &self.sender(), to, req).await
    }

    /// The current stream management state, for advisory persistence
    /// across process restarts.
    ///
    /// `None` when the stream has no resumable session. The snapshot is
    /// refreshed as counters move; exporting it is inherently racy
    /// against in-flight stanzas, which is acceptable for its advisory
    /// purpose.
    pub fn sm_snapshot(&self) -> Option<SmSnapshot> {
        self.hooks.sm_snapshot.lock().unwrap().clone()
    }

    /// Register a filter in one of the four chains.
    ///
    /// See [`StreamFilters`] for the chain layout.
    pub fn with_filters<R>(&self, f: impl FnOnce(&mut StreamFilters) -> R) -> R {
        f(&mut self.hooks.filters.lock().unwrap())
    }

    /// Register an inbound IQ request handler.
    pub fn register_iq_handler(
        &self,
        kind: IqRequestKind,
        ns: &str,
        name: &str,
        handler: IqRequestHandler,
    ) -> Result<(), HandlerAlreadyRegistered> {
        self.hooks
            .iq_handlers
            .lock()
            .unwrap()
            .register(kind, ns, name, handler)
    }

    /// Access the message dispatcher.
    pub fn with_message_dispatcher<R>(&self, f: impl FnOnce(&mut MessageDispatcher) -> R) -> R {
        f(&mut self.hooks.messages.lock().unwrap())
    }

    /// Access the presence dispatcher.
    pub fn with_presence_dispatcher<R>(&self, f: impl FnOnce(&mut PresenceDispatcher) -> R) -> R {
        f(&mut self.hooks.presences.lock().unwrap())
    }

    /// Access the payload registry.
    pub fn with_registry<R>(&self, f: impl FnOnce(&mut PayloadRegistry) -> R) -> R {
        f(&mut self.hooks.registry.lock().unwrap())
    }
}

impl Stream for StanzaStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Build a [`Reconnector`] from a [`Config`][`crate::client::Config`]-style
/// login closure with exponential backoff.
///
/// This is the low-level hook used by the client supervisor; it retries
/// `login` with the backoff schedule until a connection is obtained or
/// `slot` is dropped.
pub(crate) fn backoff_reconnector<F, Fut>(login: F) -> Reconnector
where
    F: Fn(u64) -> Fut + Send + Sync + Clone + 'static,
    Fut: core::future::Future<Output = Result<Connection, Error>> + Send,
{
    Box::new(move |_preferred_location: Option<String>, slot: oneshot::Sender<Connection>| {
        let login = login.clone();
        tokio::spawn(async move {
            const MAX_DELAY: Duration = Duration::new(30, 0);
            let mut delay = Duration::new(1, 0);
            let mut attempt: u64 = 0;
            loop {
                match login(attempt).await {
                    Ok(conn) => {
                        if slot.send(conn).is_err() {
                            log::debug!("StanzaStream dropped while a connection was in flight.");
                        }
                        return;
                    }
                    Err(e) if !e.is_retryable() => {
                        log::error!("Fatal error while connecting: {}. Giving up.", e);
                        // dropping the slot fails the stream
                        return;
                    }
                    Err(e) => {
                        log::error!("Failed to connect: {}. Retrying in {:?}.", e, delay);
                        tokio::time::sleep(delay).await;
                        delay = delay * 2;
                        if delay > MAX_DELAY {
                            delay = MAX_DELAY;
                        }
                        attempt += 1;
                    }
                }
            }
        });
    })
}
