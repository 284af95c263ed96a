// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Presence stanzas, RFC 6121 § 4.

use std::collections::BTreeMap;

use strix_schema::error::{Error, FromElementError};
use strix_schema::policy::{append_lang_map, text_lang_map};
use strix_schema::{Element, Node};

use crate::jid::Jid;
use crate::ns;

strix_schema::generate_attribute!(
    /// The type of a presence stanza. Absence of the attribute means the
    /// entity is available.
    PresenceType, "type", {
        /// The sender wishes to subscribe to the recipient's presence.
        Subscribe => "subscribe",

        /// The sender has allowed the recipient to receive their presence.
        Subscribed => "subscribed",

        /// The sender is unsubscribing from the receiver's presence.
        Unsubscribe => "unsubscribe",

        /// The subscription request has been denied or a previously granted
        /// subscription has been revoked.
        Unsubscribed => "unsubscribed",

        /// The sender is no longer available for communication.
        Unavailable => "unavailable",

        /// The sender wants to probe the current presence of the recipient.
        Probe => "probe",

        /// An error has occurred regarding processing of a previously sent
        /// presence stanza.
        Error => "error",
    }
);

/// The availability of an entity, `<show/>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Show {
    /// The entity is actively interested in chatting.
    Chat,

    /// The entity is temporarily away.
    Away,

    /// The entity is away for an extended period.
    Xa,

    /// The entity is busy (do not disturb).
    Dnd,
}

impl Show {
    fn as_str(&self) -> &'static str {
        match self {
            Show::Chat => "chat",
            Show::Away => "away",
            Show::Xa => "xa",
            Show::Dnd => "dnd",
        }
    }

    fn parse(s: &str) -> Result<Show, Error> {
        Ok(match s {
            "chat" => Show::Chat,
            "away" => Show::Away,
            "xa" => Show::Xa,
            "dnd" => Show::Dnd,
            _ => return Err(Error::Other("Invalid value for show element.")),
        })
    }
}

type Lang = String;

/// The `<presence/>` stanza.
#[derive(Debug, Clone, PartialEq)]
pub struct Presence {
    /// The sender of this presence.
    pub from: Option<Jid>,

    /// The recipient of this presence.
    pub to: Option<Jid>,

    /// The identifier of this presence, if any.
    pub id: Option<String>,

    /// The type of this presence; `None` means available.
    pub type_: Option<PresenceType>,

    /// The availability of the sender.
    pub show: Option<Show>,

    /// Free-form status of the sender, one per language.
    pub statuses: BTreeMap<Lang, String>,

    /// Priority of this resource, defaulting to 0.
    pub priority: i8,

    /// Extension payloads.
    pub payloads: Vec<Element>,
}

impl Presence {
    /// Create a presence of the given type.
    pub fn new(type_: Option<PresenceType>) -> Presence {
        Presence {
            from: None,
            to: None,
            id: None,
            type_,
            show: None,
            statuses: BTreeMap::new(),
            priority: 0,
            payloads: vec![],
        }
    }

    /// Create an available presence.
    pub fn available() -> Presence {
        Presence::new(None)
    }
}

impl TryFrom<Element> for Presence {
    type Error = FromElementError;

    fn try_from(elem: Element) -> Result<Presence, FromElementError> {
        strix_schema::check_self!(elem, "presence", ns::JABBER_CLIENT);

        let statuses = text_lang_map(&elem, "status", ns::JABBER_CLIENT);
        let mut show = None;
        let mut priority = 0i8;
        let mut payloads = Vec::new();
        for child in elem.children() {
            if child.is("status", ns::JABBER_CLIENT) {
                continue;
            }
            if child.is("show", ns::JABBER_CLIENT) {
                if show.is_some() {
                    return Err(Error::Other("More than one show element in presence.").into());
                }
                show = Some(Show::parse(&child.text())?);
                continue;
            }
            if child.is("priority", ns::JABBER_CLIENT) {
                priority = child
                    .text()
                    .parse()
                    .map_err(Error::text_parse_error)?;
                continue;
            }
            payloads.push(child.clone());
        }

        Ok(Presence {
            from: strix_schema::get_attr!(elem, "from", Option),
            to: strix_schema::get_attr!(elem, "to", Option),
            id: strix_schema::get_attr!(elem, "id", Option),
            type_: strix_schema::get_attr!(elem, "type", Option),
            show,
            statuses,
            priority,
            payloads,
        })
    }
}

impl From<Presence> for Element {
    fn from(presence: Presence) -> Element {
        let mut elem = Element::builder("presence", ns::JABBER_CLIENT)
            .attr("from", presence.from)
            .attr("to", presence.to)
            .attr("id", presence.id)
            .attr("type", presence.type_)
            .build();
        if let Some(show) = presence.show {
            let mut child = Element::bare("show", ns::JABBER_CLIENT);
            child.append_text_node(show.as_str());
            elem.append_node(Node::Element(child));
        }
        append_lang_map(&mut elem, "status", ns::JABBER_CLIENT, &presence.statuses);
        if presence.priority != 0 {
            let mut child = Element::bare("priority", ns::JABBER_CLIENT);
            child.append_text_node(presence.priority.to_string());
            elem.append_node(Node::Element(child));
        }
        for payload in presence.payloads {
            elem.append_node(Node::Element(payload));
        }
        elem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_presence_with_show() {
        let elem: Element =
            "<presence xmlns='jabber:client'><show>dnd</show><priority>-1</priority></presence>"
                .parse()
                .unwrap();
        let presence = Presence::try_from(elem).unwrap();
        assert_eq!(presence.type_, None);
        assert_eq!(presence.show, Some(Show::Dnd));
        assert_eq!(presence.priority, -1);
    }

    #[test]
    fn invalid_show_rejected() {
        let elem: Element = "<presence xmlns='jabber:client'><show>busy</show></presence>"
            .parse()
            .unwrap();
        assert!(Presence::try_from(elem).is_err());
    }

    #[test]
    fn subscription_round_trip() {
        let mut presence = Presence::new(Some(PresenceType::Subscribe));
        presence.to = Some("juliet@example.com".parse().unwrap());
        let elem: Element = presence.clone().into();
        assert_eq!(elem.attr("type"), Some("subscribe"));
        assert_eq!(Presence::try_from(elem).unwrap(), presence);
    }

    #[test]
    fn zero_priority_stays_off_the_wire() {
        let presence = Presence::available();
        let elem: Element = presence.into();
        assert!(elem.get_child("priority", ns::JABBER_CLIENT).is_none());
    }
}
