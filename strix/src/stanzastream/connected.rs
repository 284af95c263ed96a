// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::pin::Pin;
use core::task::{Context, Poll};
use std::io;

use futures::{ready, Sink, Stream};

use strix_schema::Element;
use strix_stanzas::iq::Iq;
use strix_stanzas::jid::Jid;
use strix_stanzas::ns;
use strix_stanzas::sm;
use strix_stanzas::stanza_error::{DefinedCondition, ErrorType, StanzaError};
use strix_stanzas::stream_error::StreamError;

use crate::stanza::{IdGenerator, Stanza, XmppStreamElement};
use crate::xmlstream::{ElementHead, ReadError};

use super::negotiation::{NegotiationResult, NegotiationState};
use super::queue::{QueueEntry, StanzaState, TransmitQueue};
use super::stream_management::SmState;
use super::worker::{parse_error_to_stream_error, WorkerEvent, XmppStream};
use super::Hooks;

fn publish_snapshot(hooks: &Hooks, sm_state: &Option<SmState>) {
    *hooks.sm_snapshot.lock().unwrap() =
        sm_state.as_ref().and_then(|sm| sm.snapshot());
}

/// State machine of a live (connected) stream.
pub(super) enum ConnectedState {
    /// Stream negotiation (bind, stream management) in progress.
    Negotiating { substate: NegotiationState },

    /// Negotiation is done, stanzas are flowing.
    Ready { sm_state: Option<SmState> },

    /// A local stream error is being transmitted; the stream dies
    /// afterwards.
    Failing {
        error: Option<StreamError>,
        sm_state: Option<SmState>,
    },
}

/// Result of a [`ConnectedState::poll`] call.
pub(super) enum ConnectedEvent {
    /// Pass an event up to the worker.
    Worker(WorkerEvent),

    /// The stream broke or a stream error was received.
    Disconnect {
        sm_state: Option<SmState>,
        error: Option<io::Error>,
    },

    /// The peer closed the stream cleanly.
    RemoteShutdown { sm_state: Option<SmState> },

    /// The frontend dropped the send queue; shut down locally.
    LocalShutdownRequested,
}

impl ConnectedState {
    /// Drive the state machine.
    ///
    /// `Poll::Ready(None)` means "made progress, poll again";
    /// `Poll::Ready(Some(_))` is an event for the worker loop.
    pub(super) fn poll(
        &mut self,
        mut stream: Pin<&mut XmppStream>,
        identity: &Jid,
        transmit_queue: &mut TransmitQueue<QueueEntry>,
        ids: &IdGenerator,
        hooks: &Hooks,
        cx: &mut Context<'_>,
    ) -> Poll<Option<ConnectedEvent>> {
        match self {
            Self::Negotiating { substate } => {
                match ready!(substate.advance(stream, identity, transmit_queue, cx)) {
                    core::ops::ControlFlow::Continue(None) => Poll::Ready(None),
                    core::ops::ControlFlow::Continue(Some(stanza)) => {
                        // Pre-negotiation stanza: not counted, but
                        // delivered.
                        Poll::Ready(Some(ConnectedEvent::Worker(WorkerEvent::Stanza(stanza))))
                    }
                    core::ops::ControlFlow::Break(result) => match result {
                        NegotiationResult::Disconnect { sm_state, error } => {
                            Poll::Ready(Some(ConnectedEvent::Disconnect {
                                sm_state,
                                error: Some(error),
                            }))
                        }
                        NegotiationResult::StreamReset {
                            sm_state,
                            bound_jid,
                            previous_session_lost,
                        } => {
                            if previous_session_lost {
                                // The old logical session is gone: nobody
                                // will ever answer its requests.
                                hooks.iq_tracker.fail_all();
                                hooks.iq_handlers.lock().unwrap().cancel_tasks();
                            }
                            publish_snapshot(hooks, &sm_state);
                            *self = Self::Ready { sm_state };
                            Poll::Ready(Some(ConnectedEvent::Worker(WorkerEvent::Reset {
                                bound_jid,
                            })))
                        }
                        NegotiationResult::StreamResumed { sm_state } => {
                            let sm_state = Some(sm_state);
                            publish_snapshot(hooks, &sm_state);
                            *self = Self::Ready { sm_state };
                            Poll::Ready(Some(ConnectedEvent::Worker(WorkerEvent::Resumed)))
                        }
                        NegotiationResult::StreamError { error } => {
                            *self = Self::Failing {
                                error: Some(error),
                                sm_state: None,
                            };
                            Poll::Ready(None)
                        }
                    },
                }
            }

            Self::Ready { sm_state } => {
                // Transmit side: drain pending acks, requests and queued
                // stanzas while the sink has room.
                loop {
                    match <XmppStream as Sink<&Element>>::poll_ready(stream.as_mut(), cx) {
                        Poll::Pending => break,
                        Poll::Ready(Err(error)) => {
                            let sm_state = sm_state.take();
                            return Poll::Ready(Some(ConnectedEvent::Disconnect {
                                sm_state,
                                error: Some(error),
                            }));
                        }
                        Poll::Ready(Ok(())) => (),
                    }

                    if let Some(sm) = sm_state.as_mut() {
                        if sm.pending_acks > 0 {
                            let ack: Element = sm::Nonza::Ack(sm::A::new(sm.inbound_ctr())).into();
                            match stream.as_mut().start_send(&ack) {
                                Ok(()) => {
                                    sm.pending_acks -= 1;
                                    continue;
                                }
                                Err(error) => {
                                    let sm_state = sm_state.take();
                                    return Poll::Ready(Some(ConnectedEvent::Disconnect {
                                        sm_state,
                                        error: Some(error),
                                    }));
                                }
                            }
                        }
                        if sm.pending_req {
                            let req: Element = sm::Nonza::Req(sm::R {}).into();
                            match stream.as_mut().start_send(&req) {
                                Ok(()) => {
                                    sm.pending_req = false;
                                    continue;
                                }
                                Err(error) => {
                                    let sm_state = sm_state.take();
                                    return Poll::Ready(Some(ConnectedEvent::Disconnect {
                                        sm_state,
                                        error: Some(error),
                                    }));
                                }
                            }
                        }
                    }

                    match transmit_queue.poll_next(cx) {
                        Poll::Pending => break,
                        Poll::Ready(None) => {
                            return Poll::Ready(Some(ConnectedEvent::LocalShutdownRequested))
                        }
                        Poll::Ready(Some(entry_ref)) => {
                            let mut entry = entry_ref.take();
                            if entry.aborted() {
                                entry.token.send_replace(StanzaState::Aborted);
                                continue;
                            }
                            entry.stanza.ensure_id(ids);
                            let filtered = hooks
                                .filters
                                .lock()
                                .unwrap()
                                .outbound
                                .apply_outbound((*entry.stanza).clone());
                            let Some(stanza) = filtered else {
                                entry.token.send_replace(StanzaState::Dropped);
                                continue;
                            };
                            *entry.stanza = stanza;
                            let element: Element = (*entry.stanza).clone().into();
                            match stream.as_mut().start_send(&element) {
                                Ok(()) => match sm_state.as_mut() {
                                    Some(sm) => {
                                        entry.token.send_replace(StanzaState::Sent {});
                                        sm.enqueue(entry);
                                    }
                                    None => {
                                        entry.token.send_replace(StanzaState::SentWithoutSm);
                                    }
                                },
                                Err(error) => {
                                    // serialisation rolled back; only this
                                    // stanza is affected
                                    entry.token.send_replace(StanzaState::Failed {
                                        error: (&error).into(),
                                    });
                                }
                            }
                            continue;
                        }
                    }
                }

                match <XmppStream as Sink<&Element>>::poll_flush(stream.as_mut(), cx) {
                    Poll::Ready(Err(error)) => {
                        let sm_state = sm_state.take();
                        return Poll::Ready(Some(ConnectedEvent::Disconnect {
                            sm_state,
                            error: Some(error),
                        }));
                    }
                    Poll::Ready(Ok(())) | Poll::Pending => (),
                }

                // Receive side.
                let item = ready!(stream.as_mut().poll_next(cx));
                match item {
                    Some(Ok(XmppStreamElement::Stanza(stanza))) => {
                        if let Some(sm) = sm_state.as_mut() {
                            sm.count_inbound();
                            publish_snapshot(hooks, sm_state);
                        }
                        Poll::Ready(Some(ConnectedEvent::Worker(WorkerEvent::Stanza(stanza))))
                    }

                    Some(Ok(XmppStreamElement::Sm(sm::Nonza::Ack(ack)))) => {
                        match sm_state.as_mut() {
                            Some(sm) => match sm.remote_acked(ack.h) {
                                Ok(()) => {
                                    publish_snapshot(hooks, sm_state);
                                    Poll::Ready(None)
                                }
                                Err(e) => {
                                    log::error!("stream management ack error: {}", e);
                                    let sm_state = sm_state.take();
                                    *self = Self::Failing {
                                        error: Some(e.into()),
                                        sm_state,
                                    };
                                    Poll::Ready(None)
                                }
                            },
                            None => {
                                log::warn!("received <sm:a/> on a stream without stream management; dropping");
                                Poll::Ready(None)
                            }
                        }
                    }

                    Some(Ok(XmppStreamElement::Sm(sm::Nonza::Req(_)))) => {
                        match sm_state.as_mut() {
                            Some(sm) => sm.pending_acks += 1,
                            None => log::warn!(
                                "received <sm:r/> on a stream without stream management; dropping"
                            ),
                        }
                        Poll::Ready(None)
                    }

                    Some(Ok(XmppStreamElement::Sm(other))) => {
                        log::warn!("unexpected stream management nonza mid-stream: {:?}", other);
                        Poll::Ready(None)
                    }

                    Some(Ok(XmppStreamElement::Sasl(_))) | Some(Ok(XmppStreamElement::Tls(_))) => {
                        log::warn!("negotiation nonza received mid-stream; dropping");
                        Poll::Ready(None)
                    }

                    Some(Ok(XmppStreamElement::StreamError(error))) => {
                        log::debug!("received stream error: {}", error);
                        let io_error = io::Error::new(io::ErrorKind::Other, error);
                        transmit_queue.fail(&(&io_error).into());
                        if let Some(sm) = sm_state.as_mut() {
                            sm.fail_unacked();
                        }
                        publish_snapshot(hooks, &None);
                        Poll::Ready(Some(ConnectedEvent::Disconnect {
                            sm_state: None,
                            error: Some(io_error),
                        }))
                    }

                    Some(Err(ReadError::SoftTimeout)) => {
                        Poll::Ready(Some(ConnectedEvent::Worker(WorkerEvent::SoftTimeout)))
                    }

                    Some(Err(ReadError::ParseError { error, head })) => {
                        Poll::Ready(Some(self.handle_parse_error(
                            error,
                            head,
                            transmit_queue,
                            hooks,
                        )))
                    }

                    Some(Err(ReadError::HardError(error))) => {
                        let sm_state = sm_state.take();
                        Poll::Ready(Some(ConnectedEvent::Disconnect {
                            sm_state,
                            error: Some(error),
                        }))
                    }

                    Some(Err(ReadError::StreamFooterReceived)) | None => {
                        let sm_state = sm_state.take();
                        Poll::Ready(Some(ConnectedEvent::RemoteShutdown { sm_state }))
                    }
                }
            }

            Self::Failing { error, sm_state } => {
                if let Some(error) = error.take() {
                    match ready!(<XmppStream as Sink<&Element>>::poll_ready(
                        stream.as_mut(),
                        cx
                    )) {
                        Ok(()) => {
                            let element: Element = error.into();
                            if let Err(e) = stream.as_mut().start_send(&element) {
                                log::debug!("could not serialise stream error: {}", e);
                            }
                        }
                        Err(e) => {
                            log::debug!("could not send stream error: {}", e);
                        }
                    }
                }
                match ready!(<XmppStream as Sink<&Element>>::poll_flush(
                    stream.as_mut(),
                    cx
                )) {
                    Ok(()) | Err(_) => (),
                }
                // a stream which died from a protocol violation must not
                // be resumed
                if let Some(sm) = sm_state.as_mut() {
                    sm.fail_unacked();
                }
                *sm_state = None;
                publish_snapshot(hooks, sm_state);
                Poll::Ready(Some(ConnectedEvent::Disconnect {
                    sm_state: None,
                    error: Some(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "stream failed with a local stream error",
                    )),
                }))
            }
        }
    }

    /// Handle a stanza-level parse failure.
    ///
    /// Stream management counters advance for every received stanza,
    /// including broken ones; IQ requests additionally get a
    /// `bad-request` reply so the peer is not left waiting.
    fn handle_parse_error(
        &mut self,
        error: strix_schema::Error,
        head: ElementHead,
        transmit_queue: &mut TransmitQueue<QueueEntry>,
        hooks: &Hooks,
    ) -> ConnectedEvent {
        let is_stanza =
            head.ns == ns::JABBER_CLIENT && matches!(head.name.as_str(), "message" | "presence" | "iq");
        if !is_stanza {
            // Unknown or broken top-level element: a violation of the
            // stream contract, fatal.
            log::warn!(
                "unhandleable stream element {{{}}}{}: {}",
                head.ns,
                head.name,
                error
            );
            let sm_state = match self {
                Self::Ready { sm_state } => sm_state.take(),
                _ => None,
            };
            *self = Self::Failing {
                error: Some(parse_error_to_stream_error(error)),
                sm_state,
            };
            // progress happened; the Failing state sends the error
            return ConnectedEvent::Worker(WorkerEvent::ParseError(None));
        }

        log::warn!(
            "dropping malformed {} from {:?} (id={:?}): {}",
            head.name,
            head.from,
            head.id,
            error
        );
        if let Self::Ready { sm_state } = self {
            if let Some(sm) = sm_state.as_mut() {
                sm.count_inbound();
            }
            publish_snapshot(hooks, sm_state);
        }
        // An IQ request demands exactly one reply even if we could not
        // make sense of it.
        if head.name == "iq"
            && head.id.is_some()
            && !matches!(head.type_.as_deref(), Some("result") | Some("error"))
        {
            let reply = Iq {
                from: None,
                to: head.from.as_deref().and_then(|from| from.parse().ok()),
                id: head.id.clone().unwrap_or_default(),
                payload: strix_stanzas::iq::IqType::Error(StanzaError::new(
                    ErrorType::Modify,
                    DefinedCondition::BadRequest,
                    "en",
                    "Could not parse the request.",
                )),
            };
            transmit_queue.enqueue(QueueEntry::untracked(Box::new(Stanza::Iq(reply))));
        }
        ConnectedEvent::Worker(WorkerEvent::ParseError(Some(error)))
    }

    /// Drive only the write half; never completes except on write errors.
    pub(super) fn poll_writes(
        &mut self,
        mut stream: Pin<&mut XmppStream>,
        transmit_queue: &mut TransmitQueue<QueueEntry>,
        ids: &IdGenerator,
        hooks: &Hooks,
        cx: &mut Context<'_>,
    ) -> Poll<()> {
        let Self::Ready { sm_state } = self else {
            return Poll::Pending;
        };
        loop {
            match <XmppStream as Sink<&Element>>::poll_ready(stream.as_mut(), cx) {
                Poll::Pending => return Poll::Pending,
                // errors are reported by the next duplex poll
                Poll::Ready(Err(_)) => return Poll::Ready(()),
                Poll::Ready(Ok(())) => (),
            }
            match transmit_queue.poll_next(cx) {
                Poll::Pending | Poll::Ready(None) => {
                    match <XmppStream as Sink<&Element>>::poll_flush(stream.as_mut(), cx) {
                        Poll::Ready(Err(_)) => return Poll::Ready(()),
                        Poll::Ready(Ok(())) | Poll::Pending => return Poll::Pending,
                    }
                }
                Poll::Ready(Some(entry_ref)) => {
                    let mut entry = entry_ref.take();
                    if entry.aborted() {
                        entry.token.send_replace(StanzaState::Aborted);
                        continue;
                    }
                    entry.stanza.ensure_id(ids);
                    let filtered = hooks
                        .filters
                        .lock()
                        .unwrap()
                        .outbound
                        .apply_outbound((*entry.stanza).clone());
                    let Some(stanza) = filtered else {
                        entry.token.send_replace(StanzaState::Dropped);
                        continue;
                    };
                    *entry.stanza = stanza;
                    let element: Element = (*entry.stanza).clone().into();
                    match stream.as_mut().start_send(&element) {
                        Ok(()) => match sm_state.as_mut() {
                            Some(sm) => {
                                entry.token.send_replace(StanzaState::Sent {});
                                sm.enqueue(entry);
                            }
                            None => {
                                entry.token.send_replace(StanzaState::SentWithoutSm);
                            }
                        },
                        Err(error) => {
                            entry.token.send_replace(StanzaState::Failed {
                                error: (&error).into(),
                            });
                        }
                    }
                }
            }
        }
    }

    /// Switch to sending the given stream error and failing the stream.
    pub(super) fn start_send_stream_error(&mut self, error: StreamError) {
        let sm_state = match self {
            Self::Ready { sm_state } => sm_state.take(),
            _ => None,
        };
        *self = Self::Failing {
            error: Some(error),
            sm_state,
        };
    }

    /// Enqueue a `<sm:r/>`, if stream management is enabled.
    ///
    /// Multiple calls may coalesce into a single `<sm:r/>`.
    ///
    /// Returns true if stream management is enabled.
    pub(super) fn queue_sm_request(&mut self) -> bool {
        match self {
            Self::Ready {
                sm_state: Some(sm),
            } => {
                sm.pending_req = true;
                true
            }
            _ => false,
        }
    }

    /// Close the stream cleanly.
    pub(super) fn poll_close(
        &mut self,
        mut stream: Pin<&mut XmppStream>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        <XmppStream as Sink<&Element>>::poll_close(stream.as_mut(), cx)
    }
}
