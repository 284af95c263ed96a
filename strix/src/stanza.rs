// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stanza and stream-element classification.

use core::sync::atomic::{AtomicU64, Ordering};

use rand::{thread_rng, Rng};

use strix_schema::{Element, FromElementError};
use strix_stanzas::{
    iq::Iq, jid::Jid, message::Message, ns, presence::Presence, sasl, sm, starttls,
    stream_error::StreamError,
};

/// Generator for stanza identifiers.
///
/// Ids are a monotonic counter prefixed with a random per-session nonce, so
/// they are unique within a stream's lifetime and do not collide with ids
/// minted by application code or by previous sessions.
pub struct IdGenerator {
    nonce: String,
    ctr: AtomicU64,
}

impl IdGenerator {
    /// Create a generator with a fresh random nonce.
    pub fn new() -> IdGenerator {
        let nonce: u64 = thread_rng().gen();
        IdGenerator {
            nonce: format!("{:016x}", nonce),
            ctr: AtomicU64::new(0),
        }
    }

    /// Produce the next identifier.
    pub fn next_id(&self) -> String {
        let seq = self.ctr.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.nonce, seq)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// A stanza sent/received over the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Stanza {
    /// IQ stanza
    Iq(Iq),

    /// Message stanza
    Message(Message),

    /// Presence stanza
    Presence(Presence),
}

impl Stanza {
    /// Assign a generated ID to the stanza, if no ID has been assigned yet.
    pub fn ensure_id(&mut self, ids: &IdGenerator) -> &str {
        match self {
            Self::Iq(iq) => {
                if iq.id.is_empty() {
                    iq.id = ids.next_id();
                }
                &iq.id
            }
            Self::Message(message) => message.id.get_or_insert_with(|| ids.next_id()),
            Self::Presence(presence) => presence.id.get_or_insert_with(|| ids.next_id()),
        }
    }

    /// The `from` attribute of the stanza.
    pub fn from(&self) -> Option<&Jid> {
        match self {
            Self::Iq(iq) => iq.from.as_ref(),
            Self::Message(message) => message.from.as_ref(),
            Self::Presence(presence) => presence.from.as_ref(),
        }
    }
}

impl From<Iq> for Stanza {
    fn from(other: Iq) -> Self {
        Self::Iq(other)
    }
}

impl From<Message> for Stanza {
    fn from(other: Message) -> Self {
        Self::Message(other)
    }
}

impl From<Presence> for Stanza {
    fn from(other: Presence) -> Self {
        Self::Presence(other)
    }
}

impl TryFrom<Stanza> for Message {
    type Error = Stanza;

    fn try_from(other: Stanza) -> Result<Self, Self::Error> {
        match other {
            Stanza::Message(st) => Ok(st),
            other => Err(other),
        }
    }
}

impl TryFrom<Stanza> for Presence {
    type Error = Stanza;

    fn try_from(other: Stanza) -> Result<Self, Self::Error> {
        match other {
            Stanza::Presence(st) => Ok(st),
            other => Err(other),
        }
    }
}

impl TryFrom<Stanza> for Iq {
    type Error = Stanza;

    fn try_from(other: Stanza) -> Result<Self, Self::Error> {
        match other {
            Stanza::Iq(st) => Ok(st),
            other => Err(other),
        }
    }
}

impl TryFrom<Element> for Stanza {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<Stanza, FromElementError> {
        if !elem.has_ns(ns::JABBER_CLIENT) {
            return Err(FromElementError::Mismatch(elem));
        }
        match elem.name() {
            "iq" => Ok(Stanza::Iq(Iq::try_from(elem)?)),
            "message" => Ok(Stanza::Message(Message::try_from(elem)?)),
            "presence" => Ok(Stanza::Presence(Presence::try_from(elem)?)),
            _ => Err(FromElementError::Mismatch(elem)),
        }
    }
}

impl From<Stanza> for Element {
    fn from(stanza: Stanza) -> Element {
        match stanza {
            Stanza::Iq(st) => st.into(),
            Stanza::Message(st) => st.into(),
            Stanza::Presence(st) => st.into(),
        }
    }
}

/// Any valid XMPP stream-level element.
#[derive(Debug, Clone, PartialEq)]
pub enum XmppStreamElement {
    /// A stanza.
    Stanza(Stanza),

    /// Stream management nonza.
    Sm(sm::Nonza),

    /// SASL-related nonza.
    Sasl(sasl::Nonza),

    /// STARTTLS-related nonza.
    Tls(starttls::Nonza),

    /// A stream error; fatal to the stream.
    StreamError(StreamError),
}

impl TryFrom<Element> for XmppStreamElement {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<XmppStreamElement, FromElementError> {
        let elem = match Stanza::try_from(elem) {
            Ok(stanza) => return Ok(XmppStreamElement::Stanza(stanza)),
            Err(FromElementError::Mismatch(elem)) => elem,
            Err(e) => return Err(e),
        };
        let elem = match sm::Nonza::try_from(elem) {
            Ok(nonza) => return Ok(XmppStreamElement::Sm(nonza)),
            Err(FromElementError::Mismatch(elem)) => elem,
            Err(e) => return Err(e),
        };
        let elem = match sasl::Nonza::try_from(elem) {
            Ok(nonza) => return Ok(XmppStreamElement::Sasl(nonza)),
            Err(FromElementError::Mismatch(elem)) => elem,
            Err(e) => return Err(e),
        };
        let elem = match starttls::Nonza::try_from(elem) {
            Ok(nonza) => return Ok(XmppStreamElement::Tls(nonza)),
            Err(FromElementError::Mismatch(elem)) => elem,
            Err(e) => return Err(e),
        };
        match StreamError::try_from(elem) {
            Ok(error) => Ok(XmppStreamElement::StreamError(error)),
            Err(e) => Err(e),
        }
    }
}

impl From<XmppStreamElement> for Element {
    fn from(element: XmppStreamElement) -> Element {
        match element {
            XmppStreamElement::Stanza(inner) => inner.into(),
            XmppStreamElement::Sm(inner) => inner.into(),
            XmppStreamElement::Sasl(inner) => inner.into(),
            XmppStreamElement::Tls(inner) => inner.into(),
            XmppStreamElement::StreamError(inner) => inner.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let ids = IdGenerator::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, b);
        // both carry the same session nonce
        assert_eq!(a.split('-').next(), b.split('-').next());
    }

    #[test]
    fn ensure_id_keeps_existing() {
        let ids = IdGenerator::new();
        let mut stanza = Stanza::Iq(Iq::from_get(
            "keep-me",
            Element::bare("ping", ns::PING),
        ));
        assert_eq!(stanza.ensure_id(&ids), "keep-me");
    }

    #[test]
    fn classify_stream_elements() {
        let elem: Element = "<message xmlns='jabber:client'><body>x</body></message>"
            .parse()
            .unwrap();
        match XmppStreamElement::try_from(elem).unwrap() {
            XmppStreamElement::Stanza(Stanza::Message(_)) => (),
            other => panic!("unexpected element: {:?}", other),
        }

        let elem: Element = "<r xmlns='urn:xmpp:sm:3'/>".parse().unwrap();
        match XmppStreamElement::try_from(elem).unwrap() {
            XmppStreamElement::Sm(sm::Nonza::Req(_)) => (),
            other => panic!("unexpected element: {:?}", other),
        }
    }

    #[test]
    fn unknown_top_level_is_mismatch() {
        let elem: Element = "<weird xmlns='urn:example:odd'/>".parse().unwrap();
        assert!(XmppStreamElement::try_from(elem).is_err());
    }
}
