// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::ops::ControlFlow::{self, Break, Continue};
use core::pin::Pin;
use core::task::{Context, Poll};
use std::io;

use futures::{ready, Sink, Stream};

use strix_schema::Element;
use strix_stanzas::{
    bind::{BindQuery, BindResponse},
    iq::{Iq, IqType},
    jid::{FullJid, Jid},
    sm,
    stream_error::{DefinedCondition, StreamError},
    stream_features::StreamFeatures,
};

use crate::stanza::{Stanza, XmppStreamElement};
use crate::xmlstream::ReadError;

use super::queue::{QueueEntry, TransmitQueue};
use super::stream_management::*;
use super::worker::{parse_error_to_stream_error, XmppStream};

static BIND_REQ_ID: &str = "resource-binding";
static SESSION_REQ_ID: &str = "legacy-session";

pub(super) enum NegotiationState {
    /// Send request to enable or resume stream management.
    SendSmRequest {
        /// Stream management state to use. If present, resumption will be
        /// attempted. Otherwise, a fresh session will be established.
        sm_state: Option<SmState>,

        /// If the stream has been freshly bound, we carry the bound JID
        /// along with us.
        bound_jid: Option<FullJid>,

        /// A previous logical session is already known to be gone.
        session_lost: bool,
    },

    /// Await the response to the SM enable/resume request.
    ReceiveSmResponse {
        /// State to use.
        sm_state: Option<SmState>,

        /// If the stream has been freshly bound, we carry the bound JID
        /// along with us.
        bound_jid: Option<FullJid>,

        /// A previous logical session is already known to be gone.
        session_lost: bool,
    },

    /// Send a new request to bind to a resource.
    SendBindRequest {
        sm_supported: bool,
        /// RFC 3921 session establishment must follow the bind.
        needs_session: bool,
        /// A previous logical session existed and is now known to be
        /// gone; the eventual `StreamReset` must report that.
        session_lost: bool,
    },

    /// Receive the bind response.
    ReceiveBindResponse {
        sm_supported: bool,
        needs_session: bool,
        session_lost: bool,
    },

    /// Send the RFC 3921 legacy session request.
    SendSessionRequest {
        sm_supported: bool,
        session_lost: bool,
        bound_jid: FullJid,
    },

    /// Receive the reply to the legacy session request.
    ReceiveSessionResponse {
        sm_supported: bool,
        session_lost: bool,
        bound_jid: Option<FullJid>,
    },
}

/// The ultimate result of a stream negotiation.
pub(super) enum NegotiationResult {
    /// An unplanned disconnect happened or a stream error was received
    /// from the remote party.
    Disconnect {
        /// Stream management state for a later resumption attempt.
        sm_state: Option<SmState>,

        /// I/O error which came along the disconnect.
        error: io::Error,
    },

    /// The negotiation completed successfully, but the stream was reset
    /// (i.e. stream management and all session state was lost).
    StreamReset {
        /// Stream management state. This may still be non-None if the new
        /// stream has successfully negotiated stream management.
        sm_state: Option<SmState>,

        /// The JID to which the stream is now bound.
        bound_jid: Jid,

        /// Set when a previous logical session existed and could not be
        /// resumed: its tokens and IQ waiters have to be failed.
        previous_session_lost: bool,
    },

    /// The negotiation completed successfully and a previous session was
    /// resumed.
    StreamResumed {
        /// Negotiated stream management state.
        sm_state: SmState,
    },

    /// The negotiation failed and we need to emit a stream error.
    ///
    /// **Note:** Stream errors *received* from the peer are signalled
    /// using [`Self::Disconnect`] instead, with an I/O error of kind
    /// `Other`.
    StreamError {
        /// Stream error to send to the remote party with details about
        /// the failure.
        error: StreamError,
    },
}

impl NegotiationState {
    pub fn new(features: &StreamFeatures, sm_state: Option<SmState>) -> io::Result<Self> {
        let mut session_lost = false;
        if let Some(mut sm_state) = sm_state {
            if features.stream_management.is_some() {
                return Ok(Self::SendSmRequest {
                    sm_state: Some(sm_state),
                    bound_jid: None,
                    session_lost: false,
                });
            } else {
                log::warn!("Peer is not offering stream management anymore. Dropping state.");
                sm_state.fail_unacked();
                session_lost = true;
            }
        }

        if !features.can_bind() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Peer is not offering the bind feature. Cannot proceed with stream negotiation.",
            ));
        }

        Ok(Self::SendBindRequest {
            sm_supported: features.stream_management.is_some(),
            needs_session: features.needs_legacy_session(),
            session_lost,
        })
    }

    fn flush(stream: Pin<&mut XmppStream>, cx: &mut Context) -> ControlFlow<io::Error, ()> {
        match <XmppStream as Sink<&Element>>::poll_flush(stream, cx) {
            Poll::Pending | Poll::Ready(Ok(())) => Continue(()),
            Poll::Ready(Err(error)) => Break(error),
        }
    }

    pub fn advance(
        &mut self,
        mut stream: Pin<&mut XmppStream>,
        jid: &Jid,
        transmit_queue: &mut TransmitQueue<QueueEntry>,
        cx: &mut Context<'_>,
    ) -> Poll<ControlFlow<NegotiationResult, Option<Stanza>>> {
        // When sending requests, we need to wait for the stream to become
        // ready to send and then send the corresponding request. Because
        // this stream is fresh, our tx buffers are empty enough that this
        // simplex approach cannot deadlock.
        match self {
            Self::SendBindRequest {
                sm_supported,
                needs_session,
                session_lost,
            } => {
                match ready!(<XmppStream as Sink<&Element>>::poll_ready(
                    stream.as_mut(),
                    cx
                )) {
                    Ok(()) => (),
                    Err(error) => {
                        return Poll::Ready(Break(NegotiationResult::Disconnect {
                            sm_state: None,
                            error,
                        }))
                    }
                };

                let resource = jid.resource().map(|x| x.to_owned());
                let stanza: Element = Iq::from_set(BIND_REQ_ID, BindQuery::new(resource)).into();
                match stream.start_send(&stanza) {
                    Ok(()) => (),
                    Err(e) => panic!("failed to serialize BindQuery: {}", e),
                };

                *self = Self::ReceiveBindResponse {
                    sm_supported: *sm_supported,
                    needs_session: *needs_session,
                    session_lost: *session_lost,
                };
                Poll::Ready(Continue(None))
            }

            Self::ReceiveBindResponse {
                sm_supported,
                needs_session,
                session_lost,
            } => {
                match Self::flush(stream.as_mut(), cx) {
                    Break(error) => {
                        return Poll::Ready(Break(NegotiationResult::Disconnect {
                            sm_state: None,
                            error,
                        }))
                    }
                    Continue(()) => (),
                }

                let item = ready!(stream.poll_next(cx));
                let item = item.unwrap_or_else(|| {
                    Err(ReadError::HardError(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "eof before stream footer",
                    )))
                });

                match item {
                    Ok(XmppStreamElement::Stanza(data)) => match data {
                        Stanza::Iq(iq) if iq.id == BIND_REQ_ID => {
                            let error = match iq.payload {
                                IqType::Result(Some(payload)) => {
                                    match BindResponse::try_from(payload) {
                                        Ok(v) => {
                                            let bound_jid: FullJid = v.into();
                                            if *needs_session {
                                                *self = Self::SendSessionRequest {
                                                    sm_supported: *sm_supported,
                                                    session_lost: *session_lost,
                                                    bound_jid,
                                                };
                                                return Poll::Ready(Continue(None));
                                            }
                                            if *sm_supported {
                                                *self = Self::SendSmRequest {
                                                    sm_state: None,
                                                    bound_jid: Some(bound_jid),
                                                    session_lost: *session_lost,
                                                };
                                                return Poll::Ready(Continue(None));
                                            } else {
                                                return Poll::Ready(Break(
                                                    NegotiationResult::StreamReset {
                                                        sm_state: None,
                                                        bound_jid: Jid::from(bound_jid),
                                                        previous_session_lost: *session_lost,
                                                    },
                                                ));
                                            }
                                        }
                                        Err(e) => e.to_string(),
                                    }
                                }
                                IqType::Result(None) => "Bind response has no payload".to_owned(),
                                _ => "Unexpected IQ type in response to bind request".to_owned(),
                            };
                            log::warn!("Received IQ matching the bind request, but parsing failed ({error})! Emitting stream error.");
                            Poll::Ready(Break(NegotiationResult::StreamError {
                                error: StreamError {
                                    condition: DefinedCondition::UndefinedCondition,
                                    text: Some((None, error)),
                                    application_specific: vec![],
                                },
                            }))
                        }
                        st => {
                            log::warn!("Received unexpected stanza before response to bind request: {st:?}. Dropping.");
                            Poll::Ready(Continue(None))
                        }
                    },

                    Ok(XmppStreamElement::StreamError(error)) => {
                        log::debug!("Received stream:error, failing stream and discarding any stream management state.");
                        let error = io::Error::new(io::ErrorKind::Other, error);
                        transmit_queue.fail(&(&error).into());
                        Poll::Ready(Break(NegotiationResult::Disconnect {
                            error,
                            sm_state: None,
                        }))
                    }

                    Ok(other) => {
                        log::warn!("Received unsupported stream element during bind: {other:?}. Emitting stream error.");
                        Poll::Ready(Break(NegotiationResult::StreamError {
                            error: StreamError {
                                condition: DefinedCondition::UnsupportedStanzaType,
                                text: None,
                                application_specific: vec![],
                            },
                        }))
                    }

                    // Soft timeouts during negotiation are a bad sign
                    // (because we already prompted the server to send
                    // something and are waiting for it), but also nothing
                    // to write home about.
                    Err(ReadError::SoftTimeout) => Poll::Ready(Continue(None)),

                    // Parse errors during negotiation cause an
                    // unconditional stream error.
                    Err(ReadError::ParseError { error: e, .. }) => {
                        Poll::Ready(Break(NegotiationResult::StreamError {
                            error: parse_error_to_stream_error(e),
                        }))
                    }

                    // I/O errors cause the stream to be considered
                    // broken; we drop it and send a Disconnect event with
                    // the error embedded.
                    Err(ReadError::HardError(error)) => {
                        Poll::Ready(Break(NegotiationResult::Disconnect {
                            sm_state: None,
                            error,
                        }))
                    }

                    Err(ReadError::StreamFooterReceived) => {
                        Poll::Ready(Break(NegotiationResult::Disconnect {
                            sm_state: None,
                            error: io::Error::new(
                                io::ErrorKind::InvalidData,
                                "stream footer received during negotiation",
                            ),
                        }))
                    }
                }
            }

            Self::SendSessionRequest {
                sm_supported,
                session_lost,
                bound_jid,
            } => {
                match ready!(<XmppStream as Sink<&Element>>::poll_ready(
                    stream.as_mut(),
                    cx
                )) {
                    Ok(()) => (),
                    Err(error) => {
                        return Poll::Ready(Break(NegotiationResult::Disconnect {
                            sm_state: None,
                            error,
                        }))
                    }
                };

                let payload = Element::bare("session", strix_stanzas::ns::SESSION);
                let stanza: Element = Iq::from_set(SESSION_REQ_ID, payload).into();
                match stream.start_send(&stanza) {
                    Ok(()) => (),
                    Err(e) => panic!("failed to serialize session request: {}", e),
                };

                *self = Self::ReceiveSessionResponse {
                    sm_supported: *sm_supported,
                    session_lost: *session_lost,
                    bound_jid: Some(bound_jid.clone()),
                };
                Poll::Ready(Continue(None))
            }

            Self::ReceiveSessionResponse {
                sm_supported,
                session_lost,
                bound_jid,
            } => {
                match Self::flush(stream.as_mut(), cx) {
                    Break(error) => {
                        return Poll::Ready(Break(NegotiationResult::Disconnect {
                            sm_state: None,
                            error,
                        }))
                    }
                    Continue(()) => (),
                }

                let item = ready!(stream.poll_next(cx));
                let item = item.unwrap_or_else(|| {
                    Err(ReadError::HardError(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "eof before stream footer",
                    )))
                });

                match item {
                    Ok(XmppStreamElement::Stanza(Stanza::Iq(iq))) if iq.id == SESSION_REQ_ID => {
                        match iq.payload {
                            IqType::Result(_) => {
                                let bound_jid = bound_jid.take().expect(
                                    "State machine error: no bound_jid in session negotiation.",
                                );
                                if *sm_supported {
                                    *self = Self::SendSmRequest {
                                        sm_state: None,
                                        bound_jid: Some(bound_jid),
                                        session_lost: *session_lost,
                                    };
                                    Poll::Ready(Continue(None))
                                } else {
                                    Poll::Ready(Break(NegotiationResult::StreamReset {
                                        sm_state: None,
                                        bound_jid: Jid::from(bound_jid),
                                        previous_session_lost: *session_lost,
                                    }))
                                }
                            }
                            IqType::Error(error) => {
                                log::error!(
                                    "session establishment rejected: {:?}",
                                    error.defined_condition
                                );
                                Poll::Ready(Break(NegotiationResult::Disconnect {
                                    sm_state: None,
                                    error: io::Error::new(
                                        io::ErrorKind::InvalidData,
                                        "server rejected legacy session establishment",
                                    ),
                                }))
                            }
                            _ => {
                                log::warn!("unexpected IQ type in session response; dropping");
                                Poll::Ready(Continue(None))
                            }
                        }
                    }

                    Ok(XmppStreamElement::Stanza(st)) => {
                        log::warn!("Received unexpected stanza before session response: {st:?}. Dropping.");
                        Poll::Ready(Continue(None))
                    }

                    Ok(XmppStreamElement::StreamError(error)) => {
                        let error = io::Error::new(io::ErrorKind::Other, error);
                        transmit_queue.fail(&(&error).into());
                        Poll::Ready(Break(NegotiationResult::Disconnect {
                            error,
                            sm_state: None,
                        }))
                    }

                    Ok(other) => {
                        log::warn!("Received unsupported stream element during session establishment: {other:?}. Emitting stream error.");
                        Poll::Ready(Break(NegotiationResult::StreamError {
                            error: StreamError {
                                condition: DefinedCondition::UnsupportedStanzaType,
                                text: None,
                                application_specific: vec![],
                            },
                        }))
                    }

                    Err(ReadError::SoftTimeout) => Poll::Ready(Continue(None)),

                    Err(ReadError::ParseError { error: e, .. }) => {
                        Poll::Ready(Break(NegotiationResult::StreamError {
                            error: parse_error_to_stream_error(e),
                        }))
                    }

                    Err(ReadError::HardError(error)) => {
                        Poll::Ready(Break(NegotiationResult::Disconnect {
                            sm_state: None,
                            error,
                        }))
                    }

                    Err(ReadError::StreamFooterReceived) => {
                        Poll::Ready(Break(NegotiationResult::Disconnect {
                            sm_state: None,
                            error: io::Error::new(
                                io::ErrorKind::InvalidData,
                                "stream footer received during negotiation",
                            ),
                        }))
                    }
                }
            }

            Self::SendSmRequest {
                sm_state,
                bound_jid,
                session_lost,
            } => {
                match ready!(<XmppStream as Sink<&Element>>::poll_ready(
                    stream.as_mut(),
                    cx
                )) {
                    Ok(()) => (),
                    Err(error) => {
                        return Poll::Ready(Break(NegotiationResult::Disconnect {
                            sm_state: sm_state.take(),
                            error,
                        }))
                    }
                };

                let nonza = if let Some((id, inbound_ctr)) =
                    sm_state.as_ref().and_then(|x| x.resume_info())
                {
                    // Attempt resumption
                    sm::Nonza::Resume(sm::Resume {
                        h: inbound_ctr,
                        previd: sm::StreamId(id.to_owned()),
                    })
                } else {
                    // Attempt enabling
                    sm::Nonza::Enable(sm::Enable::new().with_resume())
                };
                let element: Element = nonza.into();
                match stream.start_send(&element) {
                    Ok(()) => (),
                    Err(e) => {
                        // After poll_ready confirmed readiness, the only
                        // error start_send can produce is caused by our
                        // own data.
                        panic!("Failed to send SM nonza: {}", e);
                    }
                }

                *self = Self::ReceiveSmResponse {
                    sm_state: sm_state.take(),
                    bound_jid: bound_jid.take(),
                    session_lost: *session_lost,
                };
                // Ask caller to poll us again immediately in order to
                // start flushing the stream.
                Poll::Ready(Continue(None))
            }

            Self::ReceiveSmResponse {
                sm_state,
                bound_jid,
                session_lost,
            } => {
                match Self::flush(stream.as_mut(), cx) {
                    Break(error) => {
                        return Poll::Ready(Break(NegotiationResult::Disconnect {
                            sm_state: sm_state.take(),
                            error,
                        }))
                    }
                    Continue(()) => (),
                }

                // Non-SM data may arrive while the SM negotiation is
                // still going on.

                let item = ready!(stream.poll_next(cx));
                let item = item.unwrap_or_else(|| {
                    Err(ReadError::HardError(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "eof before stream footer",
                    )))
                });
                match item {
                    // Pre-SM data. This must not be counted yet: the
                    // counters only start with the `<enabled/>` or
                    // `<resumed/>` response.
                    Ok(XmppStreamElement::Stanza(data)) => Poll::Ready(Continue(Some(data))),

                    Ok(XmppStreamElement::Sm(sm::Nonza::Enabled(enabled))) => {
                        if sm_state.is_some() {
                            // The peer violated the stream management
                            // protocol here (or we have a bug).
                            log::warn!(
                                "Received <enabled/>, but we also have previous SM state. Attempting to proceed with a fresh session.",
                            );
                        }
                        let previous_session_lost = *session_lost || sm_state.take().is_some();
                        // We must emit Reset here because this is a fresh
                        // stream and we did not resume.
                        Poll::Ready(Break(NegotiationResult::StreamReset {
                            sm_state: Some(enabled.into()),
                            bound_jid: bound_jid.take().expect("State machine error: no bound_jid available in SM negotiation.").into(),
                            previous_session_lost,
                        }))
                    }

                    Ok(XmppStreamElement::Sm(sm::Nonza::Resumed(resumed))) => match sm_state.take()
                    {
                        Some(mut sm_state) => {
                            match sm_state.resume(resumed.h) {
                                Ok(to_retransmit) => transmit_queue.requeue_all(to_retransmit),
                                Err(e) => {
                                    // We kill the stream with an error
                                    log::error!("Resumption failed: {e}");
                                    return Poll::Ready(Break(NegotiationResult::StreamError {
                                        error: e.into(),
                                    }));
                                }
                            }
                            Poll::Ready(Break(NegotiationResult::StreamResumed { sm_state }))
                        }
                        None => {
                            // The peer claims to have resumed a session
                            // we never asked to resume. Without matching
                            // state the stream would die as soon as the
                            // peer requests our counters, so terminate it
                            // now.
                            Poll::Ready(Break(NegotiationResult::Disconnect {
                                sm_state: None,
                                error: io::Error::new(io::ErrorKind::InvalidData, "Peer replied to <sm:enable/> request with <sm:resumed/> response"),
                            }))
                        }
                    },

                    Ok(XmppStreamElement::Sm(sm::Nonza::Failed(failed))) => match sm_state.take() {
                        Some(mut sm_state) => {
                            log::debug!("Received <sm:failed/> in response to resumption request. The previous session is gone; renegotiating a fresh one.");
                            if let Some(h) = failed.h {
                                // Only an optimization; ignore errors.
                                let _: Result<_, _> = sm_state.remote_acked(h);
                            }
                            // The peer will never confirm the rest.
                            sm_state.fail_unacked();
                            *self = Self::SendBindRequest {
                                sm_supported: true,
                                session_lost: true,
                            };
                            Poll::Ready(Continue(None))
                        }
                        None => {
                            log::warn!("Received <sm:failed/> in response to enable request. Proceeding without stream management.");

                            // We must emit Reset here because this is a
                            // fresh stream and we did not resume.
                            Poll::Ready(Break(NegotiationResult::StreamReset {
                                bound_jid: bound_jid.take().expect("State machine error: no bound_jid available in SM negotiation.").into(),
                                sm_state: None,
                                previous_session_lost: *session_lost,
                            }))
                        }
                    },

                    Ok(XmppStreamElement::StreamError(error)) => {
                        log::debug!("Received stream error, failing stream and discarding any stream management state.");
                        let error = io::Error::new(io::ErrorKind::Other, error);
                        transmit_queue.fail(&(&error).into());
                        Poll::Ready(Break(NegotiationResult::Disconnect {
                            error,
                            sm_state: None,
                        }))
                    }

                    Ok(other) => {
                        log::warn!("Received unsupported stream element during negotiation: {other:?}. Emitting stream error.");
                        Poll::Ready(Break(NegotiationResult::StreamError {
                            error: StreamError {
                                condition: DefinedCondition::UnsupportedStanzaType,
                                text: None,
                                application_specific: vec![],
                            },
                        }))
                    }

                    Err(ReadError::SoftTimeout) => Poll::Ready(Continue(None)),

                    Err(ReadError::ParseError { error: e, .. }) => {
                        Poll::Ready(Break(NegotiationResult::StreamError {
                            error: parse_error_to_stream_error(e),
                        }))
                    }

                    Err(ReadError::HardError(error)) => {
                        Poll::Ready(Break(NegotiationResult::Disconnect {
                            sm_state: sm_state.take(),
                            error,
                        }))
                    }

                    Err(ReadError::StreamFooterReceived) => {
                        Poll::Ready(Break(NegotiationResult::Disconnect {
                            sm_state: sm_state.take(),
                            error: io::Error::new(
                                io::ErrorKind::InvalidData,
                                "stream footer received during negotiation",
                            ),
                        }))
                    }
                }
            }
        }
    }
}
