// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::fmt;
use std::collections::{vec_deque, VecDeque};

use strix_stanzas::sm;
use strix_stanzas::stream_error::StreamError;

use super::queue::{QueueEntry, StanzaState};

#[derive(Debug)]
pub(super) enum SmResumeInfo {
    NotResumable,
    Resumable {
        /// XEP-0198 stream ID
        id: String,

        /// Preferred IP and port for resumption as indicated by the peer.
        location: Option<String>,
    },
}

/// State for stream management
pub(super) struct SmState {
    /// Last value seen from the remote stanza counter.
    outbound_base: u32,

    /// Counter for received stanzas
    inbound_ctr: u32,

    /// Number of `<sm:a/>` we still need to send.
    ///
    /// Acks cannot always be sent right away (if our tx buffer is full),
    /// and instead of cluttering our outbound queue or something with
    /// them, we just keep a counter of unanswered `<sm:r/>`. The stream
    /// will process these in due time.
    pub(super) pending_acks: usize,

    /// Flag indicating that a `<sm:r/>` request should be sent.
    pub(super) pending_req: bool,

    /// Information about resumability of the stream
    resumption: SmResumeInfo,

    /// Unacked stanzas in the order they were sent.
    // VecDeque because of the ringbuffer-type usage: push to the back,
    // drain from the front.
    unacked_stanzas: VecDeque<QueueEntry>,
}

impl fmt::Debug for SmState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SmState")
            .field("outbound_base", &self.outbound_base)
            .field("inbound_ctr", &self.inbound_ctr)
            .field("resumption", &self.resumption)
            .field("len(unacked_stanzas)", &self.unacked_stanzas.len())
            .finish()
    }
}

/// Exportable subset of the stream management state.
///
/// Applications may persist this across process restarts to attempt
/// resumption later; doing so is advisory, the engine itself is stateless
/// between runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmSnapshot {
    /// The resumption id issued by the server.
    pub resumption_id: String,

    /// Inbound stanza counter at the time of the snapshot.
    pub inbound_ctr: u32,

    /// Outbound acked base counter at the time of the snapshot.
    pub outbound_base: u32,
}

#[derive(Debug)]
pub(super) enum SmError {
    RemoteAckedMoreStanzas {
        local_base: u32,
        queue_len: u32,
        remote_ctr: u32,
    },
    RemoteAckWentBackwards {
        local_base: u32,
        // not needed to specify the error, but needed to generate a
        // `<handled-count-too-high/>` from Self.
        queue_len: u32,
        remote_ctr: u32,
    },
}

impl From<SmError> for StreamError {
    fn from(other: SmError) -> Self {
        let (h, send_count) = match other {
            SmError::RemoteAckedMoreStanzas {
                local_base,
                queue_len,
                remote_ctr,
            } => (remote_ctr, local_base.wrapping_add(queue_len)),
            SmError::RemoteAckWentBackwards {
                local_base,
                queue_len,
                remote_ctr,
            } => (remote_ctr, local_base.wrapping_add(queue_len)),
        };
        sm::HandledCountTooHigh { h, send_count }.into()
    }
}

impl fmt::Display for SmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::RemoteAckedMoreStanzas {
                local_base,
                queue_len,
                remote_ctr,
            } => {
                let local_tip = local_base.wrapping_add(*queue_len);
                write!(f, "remote acked more stanzas than we sent: remote counter = {}. queue covers range {}..<{}", remote_ctr, local_base, local_tip)
            }
            Self::RemoteAckWentBackwards {
                local_base,
                remote_ctr,
                ..
            } => {
                write!(f, "remote acked less stanzas than before: remote counter = {}, local queue starts at {}", remote_ctr, local_base)
            }
        }
    }
}

impl SmState {
    /// Mark a stanza as sent and keep it in the stream management queue.
    pub fn enqueue(&mut self, entry: QueueEntry) {
        // The SM counters wrap at u32, so any queue longer than the u32
        // range is immediately ambiguous. RFC 1982 serial number
        // arithmetic narrows that further: a wrapped difference greater
        // than half the number space reads as negative, hence the queue
        // must stay below u32::MAX / 2.
        const MAX_QUEUE_SIZE: usize = (u32::MAX / 2 - 1) as usize;
        if self.unacked_stanzas.len() >= MAX_QUEUE_SIZE {
            // u32::MAX / 2 pending stanzas is fatal in any circumstance
            // (and there is no way to report this to the send call
            // either).
            panic!("Too many pending stanzas.");
        }

        self.unacked_stanzas.push_back(entry);
        log::trace!(
            "Stored stanza in SmState. We are now at {} unacked stanzas.",
            self.unacked_stanzas.len()
        );
    }

    /// Count an inbound stanza.
    ///
    /// Must be called for every received stanza, including those which
    /// failed to parse, and for nothing else.
    pub fn count_inbound(&mut self) {
        self.inbound_ctr = self.inbound_ctr.wrapping_add(1);
    }

    /// Process resumption.
    ///
    /// Updates the internal state according to the received remote
    /// counter. Returns an iterator which yields the queue entries which
    /// need to be retransmitted.
    pub fn resume(&mut self, h: u32) -> Result<vec_deque::Drain<'_, QueueEntry>, SmError> {
        self.remote_acked(h)?;
        // Return the entire leftover queue. We cannot receive acks for
        // them, unless they are retransmitted, because the peer has not
        // seen them yet (they got lost in the previous unclean
        // disconnect).
        Ok(self.unacked_stanzas.drain(..))
    }

    /// Process remote `<a/>`
    pub fn remote_acked(&mut self, h: u32) -> Result<(), SmError> {
        log::debug!("remote_acked: {self:?}::remote_acked({h})");
        // XEP-0198 specifies that counters are mod 2^32, which is handy
        // when you use u32 data types :-).
        let to_drop = h.wrapping_sub(self.outbound_base) as usize;
        if to_drop > 0 {
            log::trace!("remote_acked: need to drop {to_drop} stanzas");
            if to_drop > self.unacked_stanzas.len() {
                if to_drop as u32 > u32::MAX / 2 {
                    // Under RFC 1982 serial arithmetic, a wrapped
                    // difference greater than half the number space is a
                    // negative difference: h went backwards.
                    return Err(SmError::RemoteAckWentBackwards {
                        local_base: self.outbound_base,
                        queue_len: self.unacked_stanzas.len() as u32,
                        remote_ctr: h,
                    });
                } else {
                    return Err(SmError::RemoteAckedMoreStanzas {
                        local_base: self.outbound_base,
                        queue_len: self.unacked_stanzas.len() as u32,
                        remote_ctr: h,
                    });
                }
            }
            for entry in self.unacked_stanzas.drain(..to_drop) {
                if entry.aborted() {
                    entry.token.send_replace(StanzaState::Aborted);
                } else {
                    entry.token.send_replace(StanzaState::Acked {});
                }
            }
            self.outbound_base = h;
            log::debug!("remote_acked: remote acked {to_drop} stanzas");
            Ok(())
        } else {
            log::trace!("remote_acked: no stanzas to drop");
            Ok(())
        }
    }

    /// Tear the state down without resumption.
    ///
    /// All unacked stanzas transition to
    /// [`Disconnected`][`StanzaState::Disconnected`]: the peer may or may
    /// not have seen them.
    pub fn fail_unacked(&mut self) {
        for entry in self.unacked_stanzas.drain(..) {
            entry.token.send_replace(StanzaState::Disconnected);
        }
    }

    /// Downgrade all unacked stanzas to an unknown-outcome state.
    ///
    /// Used when resumption formally succeeds but the peer did not echo a
    /// counter, leaving the fate of in-flight stanzas unknowable.
    pub fn mark_unacked_sent_without_sm(&mut self) {
        for entry in self.unacked_stanzas.drain(..) {
            entry.token.send_replace(StanzaState::SentWithoutSm);
        }
    }

    /// Get the current inbound counter.
    #[inline(always)]
    pub fn inbound_ctr(&self) -> u32 {
        self.inbound_ctr
    }

    /// Get the info necessary for resumption.
    ///
    /// Returns the stream ID and the current inbound counter if
    /// resumption is available and None otherwise.
    pub fn resume_info(&self) -> Option<(&str, u32)> {
        match self.resumption {
            SmResumeInfo::Resumable { ref id, .. } => Some((id, self.inbound_ctr)),
            SmResumeInfo::NotResumable => None,
        }
    }

    /// The resumption location hint sent by the peer, if any.
    pub fn preferred_location(&self) -> Option<&str> {
        match self.resumption {
            SmResumeInfo::Resumable { ref location, .. } => location.as_deref(),
            SmResumeInfo::NotResumable => None,
        }
    }

    /// Number of stanzas sent but not yet acked.
    pub fn unacked_len(&self) -> usize {
        self.unacked_stanzas.len()
    }

    /// Export the persistable part of the state.
    pub fn snapshot(&self) -> Option<SmSnapshot> {
        match self.resumption {
            SmResumeInfo::Resumable { ref id, .. } => Some(SmSnapshot {
                resumption_id: id.clone(),
                inbound_ctr: self.inbound_ctr,
                outbound_base: self.outbound_base,
            }),
            SmResumeInfo::NotResumable => None,
        }
    }

    /// Rebuild state from a snapshot; the unacked queue starts out empty.
    pub fn from_snapshot(snapshot: SmSnapshot) -> SmState {
        SmState {
            outbound_base: snapshot.outbound_base,
            inbound_ctr: snapshot.inbound_ctr,
            pending_acks: 0,
            pending_req: false,
            resumption: SmResumeInfo::Resumable {
                id: snapshot.resumption_id,
                location: None,
            },
            unacked_stanzas: VecDeque::new(),
        }
    }
}

/// Initialize stream management state
impl From<sm::Enabled> for SmState {
    fn from(other: sm::Enabled) -> Self {
        let resumption = match (other.resume, other.id) {
            (sm::ResumeAttr::True, Some(id)) => SmResumeInfo::Resumable {
                location: other.location,
                id: id.0,
            },
            (sm::ResumeAttr::True, None) => {
                log::warn!("peer replied with <enabled resume='true'/>, but without an ID! cannot make this stream resumable.");
                SmResumeInfo::NotResumable
            }
            (sm::ResumeAttr::False, _) => SmResumeInfo::NotResumable,
        };

        Self {
            outbound_base: 0,
            inbound_ctr: 0,
            pending_acks: 0,
            pending_req: false,
            resumption,
            unacked_stanzas: VecDeque::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::queue::{QueueEntry, StanzaStage};
    use super::*;

    use strix_schema::Element;
    use strix_stanzas::iq::Iq;

    use crate::stanza::Stanza;

    fn enabled_with_id() -> sm::Enabled {
        sm::Enabled {
            id: Some(sm::StreamId("stream-1".to_owned())),
            location: None,
            max: None,
            resume: sm::ResumeAttr::True,
        }
    }

    fn entry(id: &str) -> (QueueEntry, super::super::queue::StanzaToken) {
        QueueEntry::tracked(Box::new(Stanza::Iq(Iq::from_get(
            id,
            Element::bare("ping", "urn:xmpp:ping"),
        ))))
    }

    #[test]
    fn enabled_without_id_is_not_resumable() {
        let state: SmState = sm::Enabled {
            id: None,
            location: None,
            max: None,
            resume: sm::ResumeAttr::True,
        }
        .into();
        assert!(state.resume_info().is_none());
    }

    #[test]
    fn ack_prefix_marks_tokens() {
        let mut state: SmState = enabled_with_id().into();
        let (e1, t1) = entry("a");
        let (e2, t2) = entry("b");
        let (e3, t3) = entry("c");
        state.enqueue(e1);
        state.enqueue(e2);
        state.enqueue(e3);

        state.remote_acked(2).unwrap();
        assert!(matches!(t1.state(), StanzaState::Acked {}));
        assert!(matches!(t2.state(), StanzaState::Acked {}));
        assert!(matches!(t3.state(), StanzaState::Queued));
        assert_eq!(state.unacked_len(), 1);
        // an old ack repeated is a no-op
        state.remote_acked(2).unwrap();
        assert_eq!(state.unacked_len(), 1);
    }

    #[test]
    fn overrun_and_regression_are_errors() {
        let mut state: SmState = enabled_with_id().into();
        let (e1, _t1) = entry("a");
        state.enqueue(e1);
        assert!(matches!(
            state.remote_acked(5),
            Err(SmError::RemoteAckedMoreStanzas { .. })
        ));

        let mut state: SmState = enabled_with_id().into();
        let (e1, _t1) = entry("a");
        state.enqueue(e1);
        state.remote_acked(1).unwrap();
        assert!(matches!(
            state.remote_acked(u32::MAX),
            Err(SmError::RemoteAckWentBackwards { .. })
        ));
    }

    #[test]
    fn counters_wrap() {
        let mut state = SmState::from_snapshot(SmSnapshot {
            resumption_id: "stream-1".to_owned(),
            inbound_ctr: u32::MAX,
            outbound_base: u32::MAX,
        });
        state.count_inbound();
        assert_eq!(state.inbound_ctr(), 0);

        let (e1, t1) = entry("wrap");
        state.enqueue(e1);
        // h == 0 means the single stanza beyond u32::MAX was acked
        state.remote_acked(0).unwrap();
        assert!(matches!(t1.state(), StanzaState::Acked {}));
    }

    #[test]
    fn resume_drains_remainder_for_retransmission() {
        let mut state: SmState = enabled_with_id().into();
        let (e1, t1) = entry("a");
        let (e2, t2) = entry("b");
        state.enqueue(e1);
        state.enqueue(e2);

        let retransmit: Vec<_> = state.resume(1).unwrap().collect();
        assert!(matches!(t1.state(), StanzaState::Acked {}));
        assert_eq!(retransmit.len(), 1);
        assert!(matches!(t2.state(), StanzaState::Queued));
        assert_eq!(state.unacked_len(), 0);
    }

    #[test]
    fn fail_unacked_disconnects_tokens() {
        let mut state: SmState = enabled_with_id().into();
        let (e1, t1) = entry("a");
        state.enqueue(e1);
        state.fail_unacked();
        assert!(t1.state() >= StanzaStage::Disconnected);
        assert!(matches!(t1.state(), StanzaState::Disconnected));
    }

    #[test]
    fn aborted_entry_records_abort_not_ack() {
        let mut state: SmState = enabled_with_id().into();
        let (e1, t1) = entry("a");
        state.enqueue(e1);
        t1.abort();
        state.remote_acked(1).unwrap();
        assert!(matches!(t1.state(), StanzaState::Aborted));
    }

    #[test]
    fn snapshot_round_trip() {
        let mut state: SmState = enabled_with_id().into();
        state.count_inbound();
        state.count_inbound();
        let snapshot = state.snapshot().unwrap();
        assert_eq!(snapshot.inbound_ctr, 2);
        let restored = SmState::from_snapshot(snapshot.clone());
        assert_eq!(restored.snapshot().unwrap(), snapshot);
    }
}
