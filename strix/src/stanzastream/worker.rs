// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::future::Future;
use core::ops::ControlFlow;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use std::io;
use std::sync::Arc;

use futures::{ready, SinkExt, StreamExt};

use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};

use strix_stanzas::iq::Iq;
use strix_stanzas::jid::Jid;
use strix_stanzas::ping::Ping;
use strix_stanzas::stream_error::{DefinedCondition, StreamError};
use strix_stanzas::stream_features::StreamFeatures;

use strix_schema::Element;

use crate::stanza::Stanza;
use crate::xmlstream::ReadError;

use super::connected::{ConnectedEvent, ConnectedState};
use super::negotiation::NegotiationState;
use super::queue::{QueueEntry, StanzaState, TransmitQueue};
use super::stream_management::SmState;
use super::{Event, Hooks, StreamEvent};

/// Convenience alias for the XML stream type driven by the worker.
pub type XmppStream = crate::connect::BoxedXmlStream;

/// Underlying connection for a [`StanzaStream`][`super::StanzaStream`].
pub struct Connection {
    /// The stream to use to send and receive XMPP data.
    pub stream: XmppStream,

    /// The stream features offered by the peer on the secured stream.
    pub features: StreamFeatures,

    /// The identity to which this stream belongs.
    ///
    /// Note that connectors must not return bound streams. However, the
    /// Jid may still be a full jid in order to request a specific
    /// resource at bind time. If `identity` is a bare JID, the peer will
    /// assign the resource.
    pub identity: Jid,
}

/// Callback producing new connections for the worker.
pub type Reconnector = Box<dyn FnMut(Option<String>, oneshot::Sender<Connection>) + Send + 'static>;

pub(super) static REMOTE_SHUTDOWN_TIMEOUT: Duration = Duration::new(5, 0);
pub(super) static PING_PROBE_ID_PREFIX: &str = "strix-stanzastream-liveness-probe";

pub(super) enum Never {}

pub(super) enum WorkerEvent {
    /// The stream was reset and can now be used for rx/tx.
    Reset { bound_jid: Jid },

    /// The stream has been resumed successfully.
    Resumed,

    /// Data received successfully.
    Stanza(Stanza),

    /// Failed to parse pieces from the stream.
    ParseError(Option<strix_schema::Error>),

    /// Soft timeout noted by the underlying XmlStream.
    SoftTimeout,

    /// Stream disconnected.
    Disconnected {
        /// Slot for a new connection.
        slot: oneshot::Sender<Connection>,

        /// Set to None if the stream was cleanly closed by the remote
        /// side.
        error: Option<io::Error>,
    },

    /// The reconnection backend dropped the connection channel.
    ReconnectAborted,
}

/// Map a schema error to the stream error we answer it with.
pub(super) fn parse_error_to_stream_error(e: strix_schema::Error) -> StreamError {
    use strix_schema::Error;
    let condition = match e {
        Error::XmlError(_) => DefinedCondition::NotWellFormed,
        Error::TypeMismatch => DefinedCondition::UnsupportedStanzaType,
        Error::TextParseError(_)
        | Error::Validation(_)
        | Error::PayloadNotRegistered { .. }
        | Error::Other(_) => DefinedCondition::InvalidXml,
    };
    StreamError {
        condition,
        text: Some((None, e.to_string())),
        application_specific: vec![],
    }
}

enum WorkerStream {
    /// Pending connection.
    Connecting {
        /// Optional contents of a [`WorkerEvent::Disconnected`] to emit.
        notify: Option<(oneshot::Sender<Connection>, Option<io::Error>)>,

        /// Receiver slot for the next connection.
        slot: oneshot::Receiver<Connection>,

        /// Stream management state from a previous connection.
        sm_state: Option<SmState>,

        /// Latest point in time at which a resumption may still be
        /// attempted with the stored state.
        resume_deadline: Option<Instant>,
    },

    /// Connection available.
    Connected {
        stream: XmppStream,
        substate: ConnectedState,
        identity: Jid,
    },

    /// Disconnected permanently by local choice.
    Terminated,
}

impl WorkerStream {
    fn disconnect(
        &mut self,
        sm_state: Option<SmState>,
        error: Option<io::Error>,
        resumption_window: Option<Duration>,
    ) -> WorkerEvent {
        let (tx, rx) = oneshot::channel();
        let resume_deadline = match (&sm_state, resumption_window) {
            (Some(_), Some(window)) => Some(Instant::now() + window),
            _ => None,
        };
        *self = Self::Connecting {
            notify: None,
            slot: rx,
            sm_state,
            resume_deadline,
        };
        WorkerEvent::Disconnected { slot: tx, error }
    }

    fn poll_duplex(
        self: Pin<&mut Self>,
        transmit_queue: &mut TransmitQueue<QueueEntry>,
        hooks: &Hooks,
        resumption_window: Option<Duration>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<WorkerEvent>> {
        let this = self.get_mut();
        loop {
            match this {
                // Disconnected cleanly (terminal state), signal end of
                // stream.
                Self::Terminated => return Poll::Ready(None),

                // In the progress of reconnecting, wait for reconnection
                // to complete and then switch states.
                Self::Connecting {
                    notify,
                    slot,
                    sm_state,
                    resume_deadline,
                } => {
                    if let Some((slot, error)) = notify.take() {
                        return Poll::Ready(Some(WorkerEvent::Disconnected { slot, error }));
                    }

                    match ready!(Pin::new(slot).poll(cx)) {
                        Ok(Connection {
                            stream,
                            features,
                            identity,
                        }) => {
                            let mut sm_state = sm_state.take();
                            if let Some(deadline) = resume_deadline.take() {
                                if Instant::now() > deadline {
                                    log::debug!("resumption window elapsed; discarding stream management state");
                                    if let Some(sm) = sm_state.as_mut() {
                                        sm.fail_unacked();
                                    }
                                    sm_state = None;
                                    hooks.iq_tracker.fail_all();
                                    hooks.iq_handlers.lock().unwrap().cancel_tasks();
                                }
                            }
                            let substate = ConnectedState::Negotiating {
                                // A panic here crashes the worker and thus
                                // the stream, which is exactly what we
                                // want for a non-negotiable stream.
                                substate: NegotiationState::new(&features, sm_state)
                                    .expect("Non-negotiable stream"),
                            };
                            *this = Self::Connected {
                                substate,
                                stream,
                                identity,
                            };
                        }
                        Err(_) => {
                            // The sender was dropped. This is fatal.
                            *this = Self::Terminated;
                            return Poll::Ready(Some(WorkerEvent::ReconnectAborted));
                        }
                    }
                }

                Self::Connected {
                    stream,
                    identity,
                    substate,
                } => {
                    match ready!(substate.poll(
                        Pin::new(stream),
                        identity,
                        transmit_queue,
                        &hooks.ids,
                        hooks,
                        cx
                    )) {
                        // continue looping if the substate did not produce
                        // a result.
                        None => (),

                        // produced an event to emit.
                        Some(ConnectedEvent::Worker(v)) => {
                            match v {
                                // Capture the JID from a stream reset to
                                // update our state.
                                WorkerEvent::Reset { ref bound_jid, .. } => {
                                    *identity = bound_jid.clone();
                                }
                                _ => (),
                            }
                            return Poll::Ready(Some(v));
                        }

                        // stream broke or closed somehow.
                        Some(ConnectedEvent::Disconnect { sm_state, error }) => {
                            return Poll::Ready(Some(this.disconnect(
                                sm_state,
                                error,
                                resumption_window,
                            )));
                        }

                        Some(ConnectedEvent::RemoteShutdown { sm_state }) => {
                            let error = io::Error::new(
                                io::ErrorKind::ConnectionAborted,
                                "peer closed the XML stream",
                            );
                            let resume_deadline = match (&sm_state, resumption_window) {
                                (Some(_), Some(window)) => Some(Instant::now() + window),
                                _ => None,
                            };
                            let (tx, rx) = oneshot::channel();
                            let mut new_state = Self::Connecting {
                                notify: None,
                                slot: rx,
                                sm_state,
                                resume_deadline,
                            };
                            core::mem::swap(this, &mut new_state);
                            match new_state {
                                Self::Connected { stream, .. } => {
                                    tokio::spawn(shutdown_stream_by_remote_choice(
                                        stream,
                                        REMOTE_SHUTDOWN_TIMEOUT,
                                    ));
                                }
                                _ => unreachable!(),
                            }

                            return Poll::Ready(Some(WorkerEvent::Disconnected {
                                slot: tx,
                                error: Some(error),
                            }));
                        }

                        Some(ConnectedEvent::LocalShutdownRequested) => {
                            // We don't switch to "terminated" here, but we
                            // return "end of stream" nonetheless.
                            return Poll::Ready(None);
                        }
                    }
                }
            }
        }
    }

    /// Poll the stream write-only.
    ///
    /// This never completes, not even if the `transmit_queue` is empty
    /// and its sender has been dropped, unless a write error occurs.
    ///
    /// The use case behind this is to run this in parallel to a blocking
    /// operation which should only block the receive side, but not the
    /// transmit side of the stream.
    ///
    /// Any errors are reported on the next call to `poll_duplex`.
    fn poll_writes(
        &mut self,
        transmit_queue: &mut TransmitQueue<QueueEntry>,
        hooks: &Hooks,
        cx: &mut Context,
    ) -> Poll<Never> {
        match self {
            Self::Terminated | Self::Connecting { .. } => Poll::Pending,
            Self::Connected {
                substate, stream, ..
            } => {
                ready!(substate.poll_writes(Pin::new(stream), transmit_queue, &hooks.ids, hooks, cx));
                Poll::Pending
            }
        }
    }

    fn start_send_stream_error(&mut self, error: StreamError) {
        match self {
            // If we are not connected or still connecting, we feign
            // success and enter the Terminated state.
            Self::Terminated | Self::Connecting { .. } => {
                *self = Self::Terminated;
            }

            Self::Connected { substate, .. } => substate.start_send_stream_error(error),
        }
    }

    fn poll_close(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        match self {
            Self::Terminated => Poll::Ready(Ok(())),
            Self::Connecting { .. } => {
                *self = Self::Terminated;
                Poll::Ready(Ok(()))
            }
            Self::Connected {
                substate, stream, ..
            } => {
                let result = ready!(substate.poll_close(Pin::new(stream), cx));
                *self = Self::Terminated;
                Poll::Ready(result)
            }
        }
    }

    fn drive_duplex<'a>(
        &'a mut self,
        transmit_queue: &'a mut TransmitQueue<QueueEntry>,
        hooks: &'a Hooks,
        resumption_window: Option<Duration>,
    ) -> DriveDuplex<'a> {
        DriveDuplex {
            stream: Pin::new(self),
            queue: transmit_queue,
            hooks,
            resumption_window,
        }
    }

    fn drive_writes<'a>(
        &'a mut self,
        transmit_queue: &'a mut TransmitQueue<QueueEntry>,
        hooks: &'a Hooks,
    ) -> DriveWrites<'a> {
        DriveWrites {
            stream: Pin::new(self),
            queue: transmit_queue,
            hooks,
        }
    }

    fn close(&mut self) -> Close {
        Close {
            stream: Pin::new(self),
        }
    }

    /// Enqueue a `<sm:r/>`, if stream management is enabled.
    fn queue_sm_request(&mut self) -> bool {
        match self {
            Self::Terminated | Self::Connecting { .. } => false,
            Self::Connected { substate, .. } => substate.queue_sm_request(),
        }
    }
}

struct DriveDuplex<'x> {
    stream: Pin<&'x mut WorkerStream>,
    queue: &'x mut TransmitQueue<QueueEntry>,
    hooks: &'x Hooks,
    resumption_window: Option<Duration>,
}

impl<'x> Future for DriveDuplex<'x> {
    type Output = Option<WorkerEvent>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.get_mut();
        let window = this.resumption_window;
        this.stream
            .as_mut()
            .poll_duplex(this.queue, this.hooks, window, cx)
    }
}

struct DriveWrites<'x> {
    stream: Pin<&'x mut WorkerStream>,
    queue: &'x mut TransmitQueue<QueueEntry>,
    hooks: &'x Hooks,
}

impl<'x> Future for DriveWrites<'x> {
    type Output = Never;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.stream.as_mut().poll_writes(this.queue, this.hooks, cx)
    }
}

struct Close<'x> {
    stream: Pin<&'x mut WorkerStream>,
}

impl<'x> Future for Close<'x> {
    type Output = io::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.stream.as_mut().poll_close(cx)
    }
}

/// Worker system for a [`StanzaStream`][`super::StanzaStream`].
pub(super) struct StanzaStreamWorker {
    reconnector: Reconnector,
    frontend_tx: mpsc::Sender<Event>,
    stream: WorkerStream,
    transmit_queue: TransmitQueue<QueueEntry>,
    hooks: Arc<Hooks>,
    reply_rx: mpsc::UnboundedReceiver<Iq>,
    reply_tx: mpsc::UnboundedSender<Iq>,
    resumption_window: Option<Duration>,
}

macro_rules! send_or_break {
    ($value:expr => $permit:ident in $ch:expr, $txq:expr, $hooks:expr => $stream:expr$(,)?) => {
        if let Some(permit) = $permit.take() {
            log::trace!("stanza received, passing to frontend via permit");
            permit.send($value);
        } else {
            log::trace!("no permit for received stanza available, blocking on channel send while handling writes");
            tokio::select! {
                // drive_writes never completes: I/O errors are reported on
                // the next call to drive_duplex(), which makes it ideal
                // for use in parallel to $ch.send().
                result = $stream.drive_writes(&mut $txq, &$hooks) => { match result {} },
                result = $ch.send($value) => match result {
                    Err(_) => break,
                    Ok(()) => (),
                },
            }
        }
    };
}

impl StanzaStreamWorker {
    pub fn spawn(
        mut reconnector: Reconnector,
        queue_depth: usize,
        hooks: Arc<Hooks>,
        resumption_window: Option<Duration>,
    ) -> (mpsc::Sender<QueueEntry>, mpsc::Receiver<Event>) {
        let (conn_tx, conn_rx) = oneshot::channel();
        reconnector(None, conn_tx);
        // c2f = core to frontend
        let (c2f_tx, c2f_rx) = mpsc::channel(queue_depth);
        // f2c = frontend to core
        let (f2c_tx, transmit_queue) = TransmitQueue::channel(queue_depth);
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let mut worker = StanzaStreamWorker {
            reconnector,
            frontend_tx: c2f_tx,
            stream: WorkerStream::Connecting {
                slot: conn_rx,
                sm_state: None,
                notify: None,
                resume_deadline: None,
            },
            transmit_queue,
            hooks,
            reply_rx,
            reply_tx,
            resumption_window,
        };
        tokio::spawn(async move { worker.run().await });
        (f2c_tx, c2f_rx)
    }

    /// Route one received stanza.
    ///
    /// Filters run first; IQ responses settle their waiters; IQ requests
    /// go to the handler registry (whose replies flow back through
    /// `reply_tx`); messages and presences pass the dispatchers. Whatever
    /// remains is forwarded to the frontend.
    fn route_stanza(&mut self, stanza: Stanza) -> Option<Event> {
        let stanza = self
            .hooks
            .filters
            .lock()
            .unwrap()
            .inbound
            .apply_inbound(stanza)?;
        match stanza {
            Stanza::Iq(iq) => {
                if iq.payload.is_request() {
                    self.hooks
                        .iq_handlers
                        .lock()
                        .unwrap()
                        .dispatch(iq, self.reply_tx.clone());
                    None
                } else {
                    match self.hooks.iq_tracker.handle_iq(iq) {
                        ControlFlow::Break(()) => None,
                        ControlFlow::Continue(iq) => {
                            log::debug!(
                                "dropping unmatched IQ response from {:?} with id {:?}",
                                iq.from,
                                iq.id
                            );
                            None
                        }
                    }
                }
            }
            Stanza::Message(message) => {
                let type_ = Some(message.type_.clone());
                let from = message.from.clone();
                self.hooks
                    .messages
                    .lock()
                    .unwrap()
                    .dispatch(type_, from.as_ref(), message)
                    .map(|message| Event::Stanza(Stanza::Message(message)))
            }
            Stanza::Presence(presence) => {
                let type_ = presence.type_.clone();
                let from = presence.from.clone();
                self.hooks
                    .presences
                    .lock()
                    .unwrap()
                    .dispatch(type_, from.as_ref(), presence)
                    .map(|presence| Event::Stanza(Stanza::Presence(presence)))
            }
        }
    }

    pub async fn run(&mut self) {
        let mut ping_probe_ctr: u64 = rand::random();

        // We use mpsc::Sender permits as a way to avoid blocking on the
        // `frontend_tx` whenever possible. If we have a permit available,
        // any event we receive from the stream can be sent to the
        // frontend without blocking. Otherwise the send_or_break macro
        // uses the normal Sender::send coroutine function, servicing
        // stream writes in parallel.
        let mut permit = None;
        loop {
            tokio::select! {
                new_permit = self.frontend_tx.reserve(), if permit.is_none() && !self.frontend_tx.is_closed() => match new_permit {
                    Ok(new_permit) => permit = Some(new_permit),
                    // Receiver side dropped… That is stream closure, so
                    // we shut everything down and exit.
                    Err(_) => break,
                },
                reply = self.reply_rx.recv() => {
                    if let Some(reply) = reply {
                        self.transmit_queue.enqueue(QueueEntry::untracked(Box::new(Stanza::Iq(reply))));
                    }
                },
                ev = self.stream.drive_duplex(&mut self.transmit_queue, &self.hooks, self.resumption_window) => {
                    let Some(ev) = ev else {
                        // Stream terminated by local choice. Exit.
                        break;
                    };
                    match ev {
                        WorkerEvent::Reset { bound_jid } => send_or_break!(
                            Event::Stream(StreamEvent::Reset { bound_jid }) => permit in self.frontend_tx,
                            self.transmit_queue, self.hooks => self.stream,
                        ),
                        WorkerEvent::Disconnected { slot, error } => {
                            send_or_break!(
                                Event::Stream(StreamEvent::Suspended) => permit in self.frontend_tx,
                                self.transmit_queue, self.hooks => self.stream,
                            );
                            if let Some(error) = error {
                                log::debug!("Backend stream got disconnected because of an I/O error: {error}. Attempting reconnect.");
                            } else {
                                log::debug!("Backend stream got disconnected for an unknown reason. Attempting reconnect.");
                            }
                            if self.frontend_tx.is_closed() || self.transmit_queue.is_closed() {
                                log::debug!("Immediately aborting reconnect because the frontend is gone.");
                                break;
                            }
                            (self.reconnector)(None, slot);
                        }
                        WorkerEvent::Resumed => send_or_break!(
                            Event::Stream(StreamEvent::Resumed) => permit in self.frontend_tx,
                            self.transmit_queue, self.hooks => self.stream,
                        ),
                        WorkerEvent::Stanza(stanza) => {
                            if let Some(event) = self.route_stanza(stanza) {
                                send_or_break!(
                                    event => permit in self.frontend_tx,
                                    self.transmit_queue, self.hooks => self.stream,
                                );
                            }
                        }
                        WorkerEvent::ParseError(e) => {
                            if let Some(e) = e {
                                log::error!("Parse error on stream: {e}");
                            } else {
                                log::error!("Fatal parse error on stream; failing stream.");
                            }
                            // the ConnectedState has already transitioned
                            // to Failing where appropriate
                        }
                        WorkerEvent::SoftTimeout => {
                            if self.stream.queue_sm_request() {
                                log::debug!("SoftTimeout tripped: enqueued <sm:r/>");
                            } else {
                                log::debug!("SoftTimeout tripped. Stream Management is not enabled, enqueueing ping IQ");
                                ping_probe_ctr = ping_probe_ctr.wrapping_add(1);
                                // to/from can stay blank for a c2s ping to
                                // the peer server.
                                self.transmit_queue.enqueue(QueueEntry::untracked(Box::new(
                                    Stanza::Iq(Iq::from_get(
                                        format!("{}-{}", PING_PROBE_ID_PREFIX, ping_probe_ctr),
                                        Element::from(Ping {}),
                                    )),
                                )));
                            }
                        }
                        WorkerEvent::ReconnectAborted => {
                            log::error!("Connection backend gave up; terminating stream.");
                            self.transmit_queue.disconnect_all();
                            self.hooks.iq_tracker.fail_all();
                            self.hooks.iq_handlers.lock().unwrap().cancel_tasks();
                            break;
                        }
                    }
                },
            }
        }
        match self.stream.close().await {
            Ok(()) => log::debug!("Stream closed successfully"),
            Err(e) => log::debug!("Stream closure failed: {e}"),
        }
    }
}

async fn shutdown_stream_by_remote_choice(mut stream: XmppStream, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    match tokio::time::timeout_at(deadline, stream.shutdown()).await {
        // We don't really care about success or failure here.
        Ok(_) => (),
        // .. but if we ran into a timeout, we exit here right away.
        Err(_) => {
            log::debug!("Giving up on clean stream shutdown after timeout elapsed.");
            return;
        }
    }
    let timeout = tokio::time::sleep_until(deadline);
    tokio::pin!(timeout);
    loop {
        tokio::select! {
            _ = &mut timeout => {
                log::debug!("Giving up on clean stream shutdown after timeout elapsed.");
                break;
            }
            ev = stream.next() => match ev {
                None => break,
                Some(Ok(data)) => {
                    log::debug!("Ignoring data on stream during shutdown: {data:?}");
                }
                Some(Err(ReadError::HardError(e))) => {
                    log::debug!("Ignoring stream I/O error during shutdown: {e}");
                    break;
                }
                Some(Err(ReadError::SoftTimeout)) => (),
                Some(Err(ReadError::ParseError { .. })) => (),
                Some(Err(ReadError::StreamFooterReceived)) => break,
            }
        }
    }
}
