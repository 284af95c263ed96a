// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stream Management nonzas, XEP-0198.

use strix_schema::error::FromElementError;
use strix_schema::Element;

use crate::ns;
use crate::stream_error::{DefinedCondition, StreamError};

strix_schema::generate_element!(
    /// Acknowledgement of the currently received stanzas.
    A, "a", crate::ns::SM,
    attributes: [
        /// The last handled stanza.
        h: Required<u32> = "h",
    ]
);

impl A {
    /// Generates a new `<a/>` element.
    pub fn new(h: u32) -> A {
        A { h }
    }
}

strix_schema::generate_attribute!(
    /// Whether to allow resumption of a previous stream.
    ResumeAttr,
    "resume",
    bool
);

strix_schema::generate_element!(
    /// Client request for enabling stream management.
    Enable, "enable", crate::ns::SM,
    attributes: [
        /// The preferred resumption time in seconds by the client.
        max: Option<u32> = "max",

        /// Whether the client wants to be allowed to resume the stream.
        resume: Default<ResumeAttr> = "resume",
    ]
);

impl Enable {
    /// Generates a new `<enable/>` element.
    pub fn new() -> Self {
        Enable {
            max: None,
            resume: ResumeAttr::False,
        }
    }

    /// Asks for resumption to be possible.
    pub fn with_resume(mut self) -> Self {
        self.resume = ResumeAttr::True;
        self
    }
}

strix_schema::generate_id!(
    /// A random identifier used for stream resumption.
    StreamId
);

strix_schema::generate_element!(
    /// Server response once stream management is enabled.
    Enabled, "enabled", crate::ns::SM,
    attributes: [
        /// A random identifier used for stream resumption.
        id: Option<StreamId> = "id",

        /// The preferred IP, domain, IP:port or domain:port location for
        /// resumption.
        location: Option<String> = "location",

        /// The preferred resumption time in seconds by the server.
        max: Option<u32> = "max",

        /// Whether stream resumption is allowed.
        resume: Default<ResumeAttr> = "resume",
    ]
);

strix_schema::generate_element!(
    /// A stream management error happened.
    Failed, "failed", crate::ns::SM,
    attributes: [
        /// The last handled stanza.
        h: Option<u32> = "h",
    ]
);

strix_schema::generate_element!(
    /// Requests the currently received stanzas by the other party.
    R, "r", crate::ns::SM
);

strix_schema::generate_element!(
    /// Requests a stream resumption.
    Resume, "resume", crate::ns::SM,
    attributes: [
        /// The last handled stanza.
        h: Required<u32> = "h",

        /// The previous id given by the server in `<enabled/>`.
        previd: Required<StreamId> = "previd",
    ]
);

strix_schema::generate_element!(
    /// The response by the server for a successfully resumed stream.
    Resumed, "resumed", crate::ns::SM,
    attributes: [
        /// The last handled stanza.
        h: Required<u32> = "h",

        /// The previous id given by the server in `<enabled/>`.
        previd: Required<StreamId> = "previd",
    ]
);

/// Represents availability of Stream Management in `<stream:features/>`.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamManagement {
    /// Whether negotiating stream management is optional.
    pub optional: bool,
}

impl TryFrom<Element> for StreamManagement {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<StreamManagement, FromElementError> {
        strix_schema::check_self!(elem, "sm", ns::SM);
        let optional = elem.has_child("optional", ns::SM);
        Ok(StreamManagement { optional })
    }
}

impl From<StreamManagement> for Element {
    fn from(feature: StreamManagement) -> Element {
        let mut elem = Element::bare("sm", ns::SM);
        if feature.optional {
            elem.append_child(Element::bare("optional", ns::SM));
        }
        elem
    }
}

/// Any stream management nonza which may appear on a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Nonza {
    /// `<a/>`
    Ack(A),

    /// `<r/>`
    Req(R),

    /// `<enable/>`
    Enable(Enable),

    /// `<enabled/>`
    Enabled(Enabled),

    /// `<resume/>`
    Resume(Resume),

    /// `<resumed/>`
    Resumed(Resumed),

    /// `<failed/>`
    Failed(Failed),
}

impl TryFrom<Element> for Nonza {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<Nonza, FromElementError> {
        if !elem.has_ns(ns::SM) {
            return Err(FromElementError::Mismatch(elem));
        }
        match elem.name() {
            "a" => Ok(Nonza::Ack(A::try_from(elem)?)),
            "r" => Ok(Nonza::Req(R::try_from(elem)?)),
            "enable" => Ok(Nonza::Enable(Enable::try_from(elem)?)),
            "enabled" => Ok(Nonza::Enabled(Enabled::try_from(elem)?)),
            "resume" => Ok(Nonza::Resume(Resume::try_from(elem)?)),
            "resumed" => Ok(Nonza::Resumed(Resumed::try_from(elem)?)),
            "failed" => Ok(Nonza::Failed(Failed::try_from(elem)?)),
            _ => Err(FromElementError::Mismatch(elem)),
        }
    }
}

impl From<Nonza> for Element {
    fn from(nonza: Nonza) -> Element {
        match nonza {
            Nonza::Ack(nonza) => nonza.into(),
            Nonza::Req(nonza) => nonza.into(),
            Nonza::Enable(nonza) => nonza.into(),
            Nonza::Enabled(nonza) => nonza.into(),
            Nonza::Resume(nonza) => nonza.into(),
            Nonza::Resumed(nonza) => nonza.into(),
            Nonza::Failed(nonza) => nonza.into(),
        }
    }
}

/// Application-specific stream error for counters which went out of range,
/// sent when the peer acks stanzas we never sent.
#[derive(Debug, Clone, PartialEq)]
pub struct HandledCountTooHigh {
    /// The counter value received from the peer.
    pub h: u32,

    /// The number of stanzas actually sent.
    pub send_count: u32,
}

impl From<HandledCountTooHigh> for StreamError {
    fn from(other: HandledCountTooHigh) -> StreamError {
        let mut app = Element::bare("handled-count-too-high", ns::SM);
        app.set_attr("h", other.h);
        app.set_attr("send-count", other.send_count);
        StreamError {
            condition: DefinedCondition::UndefinedCondition,
            text: Some((
                None,
                format!(
                    "You acknowledged {} stanzas, but I only sent you {} so far.",
                    other.h, other.send_count
                ),
            )),
            application_specific: vec![app],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a() {
        let elem: Element = "<a xmlns='urn:xmpp:sm:3' h='5'/>".parse().unwrap();
        let a = A::try_from(elem).unwrap();
        assert_eq!(a.h, 5);
    }

    #[test]
    fn stream_feature() {
        let elem: Element = "<sm xmlns='urn:xmpp:sm:3'/>".parse().unwrap();
        let feature = StreamManagement::try_from(elem).unwrap();
        assert!(!feature.optional);
    }

    #[test]
    fn resume() {
        let elem: Element = "<enable xmlns='urn:xmpp:sm:3' resume='true'/>"
            .parse()
            .unwrap();
        let enable = Enable::try_from(elem).unwrap();
        assert_eq!(enable.max, None);
        assert_eq!(enable.resume, ResumeAttr::True);

        let elem: Element = "<enabled xmlns='urn:xmpp:sm:3' resume='true' id='coucou' max='600'/>"
            .parse()
            .unwrap();
        let enabled = Enabled::try_from(elem).unwrap();
        let previd = enabled.id.unwrap();
        assert_eq!(enabled.resume, ResumeAttr::True);
        assert_eq!(previd, StreamId(String::from("coucou")));
        assert_eq!(enabled.max, Some(600));
        assert_eq!(enabled.location, None);

        let elem: Element = "<resume xmlns='urn:xmpp:sm:3' h='5' previd='coucou'/>"
            .parse()
            .unwrap();
        let resume = Resume::try_from(elem).unwrap();
        assert_eq!(resume.h, 5);
        assert_eq!(resume.previd, previd);

        let elem: Element = "<resumed xmlns='urn:xmpp:sm:3' h='5' previd='coucou'/>"
            .parse()
            .unwrap();
        let resumed = Resumed::try_from(elem).unwrap();
        assert_eq!(resumed.h, 5);
        assert_eq!(resumed.previd, previd);
    }

    #[test]
    fn counter_wraps_at_u32() {
        let elem: Element = "<a xmlns='urn:xmpp:sm:3' h='4294967295'/>".parse().unwrap();
        let a = A::try_from(elem).unwrap();
        assert_eq!(a.h, u32::MAX);
        assert_eq!(a.h.wrapping_add(1), 0);
    }

    #[test]
    fn nonza_dispatch() {
        let elem: Element = "<r xmlns='urn:xmpp:sm:3'/>".parse().unwrap();
        match Nonza::try_from(elem).unwrap() {
            Nonza::Req(_) => (),
            other => panic!("unexpected nonza: {:?}", other),
        }
    }

    #[test]
    fn handled_count_too_high_stream_error() {
        let err: StreamError = HandledCountTooHigh {
            h: 10,
            send_count: 4,
        }
        .into();
        assert_eq!(err.application_specific.len(), 1);
        assert_eq!(err.application_specific[0].attr("h"), Some("10"));
    }
}
